//! Application context: everything one running service owns.
//!
//! No process-wide globals; admin commands and the trading tick all
//! reach the traders through this context. The single worker thread
//! serializes them.

use crate::config::BotConfig;
use crate::error::{BotError, Result};
use parking_lot::{Condvar, Mutex};
use pmm_exchange::{Emulator, SharedStockApi, StockApi, StockSelector};
use pmm_report::{parse_bind, spawn_server, QueuedStats, Report, ServerHandle};
use pmm_sched::{ActionQueue, Handle, Scheduler, Worker};
use pmm_storage::{Format, StorageFactory};
use pmm_trader::Trader;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn};

/// Traders and their broker registry; locked by whoever works on
/// them (in practice always the worker thread).
pub struct TradingState {
    pub selector: StockSelector,
    pub traders: Vec<Trader>,
}

impl TradingState {
    pub fn find_trader(&mut self, ident: &str) -> Option<&mut Trader> {
        self.traders.iter_mut().find(|t| t.ident() == ident)
    }
}

pub struct App {
    cfg: BotConfig,
    scheduler: Scheduler,
    worker: Worker,
    queue: ActionQueue,
    report: Arc<Report>,
    state: Arc<Mutex<TradingState>>,
    run_handle: Mutex<Option<Handle>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    _http: Option<ServerHandle>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    /// Build the whole context from config: storage factories,
    /// broker registry, traders, report, and the optional HTTP
    /// server. `dry_run` wraps every trader's broker in an emulator.
    pub fn new(cfg: BotConfig, dry_run: bool) -> Result<Self> {
        let scheduler = Scheduler::new(1);
        let worker = scheduler.worker();
        let queue = ActionQueue::new(scheduler.clone());

        let trader_format = if cfg.traders.storage_binary {
            Format::Binary
        } else {
            Format::Json
        };
        let trader_store = StorageFactory::new(&cfg.traders.storage_path, 5, trader_format)?;
        let report_store = StorageFactory::new(&cfg.report.path, 2, Format::Json)?;
        let report = Arc::new(Report::new(
            report_store.create("report.json"),
            cfg.report.interval,
            cfg.report.a2np,
        ));

        let mut selector = StockSelector::new();
        selector.load(&cfg.brokers);

        let mut traders = Vec::new();
        for id in cfg.trader_ids() {
            let tcfg = cfg.trader_config(&id)?;
            let shared = selector
                .get(&tcfg.broker)
                .ok_or_else(|| BotError::UnknownBroker(tcfg.broker.clone()))?;
            let base: Box<dyn StockApi> = Box::new(SharedStockApi(shared));
            let stock: Box<dyn StockApi> = if dry_run || tcfg.dry_run {
                Box::new(Emulator::new(base, tcfg.initial_currency))
            } else {
                base
            };
            let stats = QueuedStats::new(queue.clone(), report.clone());
            info!(trader = %id, pair = %tcfg.pair, broker = %tcfg.broker, "trader configured");
            traders.push(Trader::new(
                id.clone(),
                tcfg,
                stock,
                trader_store.create(&id),
                Box::new(stats),
            ));
        }

        let http = match &cfg.report.http_bind {
            Some(bind) => {
                let addr = parse_bind(bind)?;
                Some(spawn_server(
                    addr,
                    cfg.report.path.clone(),
                    cfg.report.http_auth.clone(),
                    cfg.service.name.clone(),
                )?)
            }
            None => None,
        };

        Ok(Self {
            cfg,
            scheduler,
            worker,
            queue,
            report,
            state: Arc::new(Mutex::new(TradingState { selector, traders })),
            run_handle: Mutex::new(None),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            _http: http,
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.cfg
    }

    pub fn worker(&self) -> Worker {
        self.worker.clone()
    }

    pub fn queue(&self) -> ActionQueue {
        self.queue.clone()
    }

    pub fn report(&self) -> Arc<Report> {
        self.report.clone()
    }

    pub fn state(&self) -> Arc<Mutex<TradingState>> {
        self.state.clone()
    }

    /// Install the trading ticks: a one-second warmup one-shot and
    /// the recurring one-minute cycle.
    pub fn start_ticks(&self) {
        let mut handle = self.run_handle.lock();
        if handle.is_some() {
            return;
        }
        {
            let state = self.state.clone();
            let report = self.report.clone();
            self.scheduler.after(Duration::from_secs(1), move || {
                run_cycle(&state, &report);
            });
        }
        let state = self.state.clone();
        let report = self.report.clone();
        let id = self.scheduler.each(Duration::from_secs(60), move || {
            run_cycle(&state, &report);
        });
        *handle = Some(id);
        info!("trading ticks installed");
    }

    /// Ask the foreground service to exit.
    pub fn request_stop(&self) {
        let (flag, cv) = &*self.stop;
        *flag.lock() = true;
        cv.notify_all();
    }

    /// Block until `request_stop` is called.
    pub fn wait_for_stop(&self) {
        let (flag, cv) = &*self.stop;
        let mut stopped = flag.lock();
        while !*stopped {
            cv.wait(&mut stopped);
        }
    }

    /// Remove the tick, drain in-flight work, and drop traders and
    /// brokers. A running cycle completes; nothing new starts.
    pub fn shutdown(&self) {
        if let Some(id) = self.run_handle.lock().take() {
            self.scheduler.remove(id);
        }
        self.scheduler.sync();
        {
            let mut state = self.state.lock();
            state.traders.clear();
            state.selector.clear();
        }
        self.scheduler.shutdown();
        info!("---- exit ----");
    }
}

/// One scheduler tick: reset every adapter, run every trader, then
/// regenerate the report.
fn run_cycle(state: &Arc<Mutex<TradingState>>, report: &Arc<Report>) {
    let mut state = state.lock();
    let mut reset_ok = true;
    state.selector.for_each(|name, api| {
        match api.lock().reset() {
            Ok(true) => {}
            Ok(false) => {
                warn!(broker = %name, "adapter reset refused, skipping tick");
                reset_ok = false;
            }
            Err(e) => {
                warn!(broker = %name, error = %e, "adapter reset failed, skipping tick");
                reset_ok = false;
            }
        }
    });
    if !reset_ok {
        return;
    }

    for trader in state.traders.iter_mut() {
        let span = info_span!("trader", ident = %trader.ident());
        let _guard = span.enter();
        match catch_unwind(AssertUnwindSafe(|| trader.perform())) {
            Ok(Ok(hit)) => {
                if hit {
                    info!("cycle reconciled trades");
                }
            }
            Ok(Err(e)) if e.is_transient() => {
                warn!(error = %e, "cycle skipped, will retry next tick");
            }
            Ok(Err(e)) => {
                error!(error = %e, "cycle failed");
            }
            Err(_) => {
                error!("cycle panicked, skipped");
            }
        }
    }
    report.gen_report();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> BotConfig {
        let text = format!(
            r#"
            [service]
            inst_file = "{base}/pmmbot"

            [traders]
            list = "btc"
            storage_path = "{base}/data"

            [report]
            path = "{base}/www"

            [brokers]
            emu = "true"

            [trader.btc]
            broker = "emu"
            pair = "BTCUSD"
            order_size = "0.01"
            dry_run = true
            "#,
            base = dir.path().display()
        );
        toml::from_str(&text).unwrap()
    }

    #[test]
    fn test_app_builds_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let app = App::new(config(&dir), true).unwrap();
        assert_eq!(app.state().lock().traders.len(), 1);
        app.shutdown();
        assert_eq!(app.state().lock().traders.len(), 0);
    }

    #[test]
    fn test_unknown_broker_fails_construction() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.brokers.clear();
        // Validation normally catches this at load; construction
        // must fail too when handed an inconsistent config.
        let err = App::new(cfg, true).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
