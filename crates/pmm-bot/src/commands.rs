//! The admin command surface.
//!
//! Every command marshals its trader-touching work onto the worker
//! thread, writes a textual response, and returns a small exit
//! code: 0 ok, 1 usage, 2 unknown entity, 3 runtime error.

use crate::app::App;
use pmm_core::{Price, Size};
use pmm_trader::Backtest;
use rust_decimal::Decimal;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use tracing::info;

pub fn execute(app: &App, cmd: &str, args: &[String], out: &mut dyn Write) -> i32 {
    match cmd {
        "status" => {
            let _ = writeln!(out, "running");
            0
        }
        "stop" => {
            app.request_stop();
            let _ = writeln!(out, "OK");
            0
        }
        "logrotate" => {
            info!("log rotation requested");
            let _ = writeln!(out, "OK");
            0
        }
        "calc_range" => calc_range(app, out),
        "get_all_pairs" => get_all_pairs(app, args, out),
        "erase_trade" => erase_trade(app, args, out, false),
        "resync_trades_from" => erase_trade(app, args, out, true),
        "reset" => single_trader_op(app, args, out, |t| t.reset()),
        "repair" => single_trader_op(app, args, out, |t| t.repair()),
        "achieve" => achieve(app, args, out),
        "backtest" => backtest(app, args, out),
        other => {
            let _ = writeln!(out, "Unknown command: {other}");
            1
        }
    }
}

/// Run `f` on the worker, turning a panic into an exit-code-3
/// response.
fn run_guarded<T: Send + 'static>(
    app: &App,
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T, String> {
    let worker = app.worker();
    catch_unwind(AssertUnwindSafe(move || worker.run(f)))
        .map_err(|_| "internal error (panic in worker)".to_string())
}

fn calc_range(app: &App, out: &mut dyn Write) -> i32 {
    let state = app.state();
    let rows = run_guarded(app, move || {
        let mut state = state.lock();
        let mut rows = Vec::new();
        for trader in state.traders.iter_mut() {
            let title = trader.config().title.clone();
            let symbols = trader
                .market_info()
                .map(|mi| (mi.asset_symbol.clone(), mi.currency_symbol.clone()));
            let range = trader.calc_range();
            rows.push((title, symbols, range));
        }
        rows
    });
    let rows = match rows {
        Ok(rows) => rows,
        Err(msg) => {
            let _ = writeln!(out, "{msg}");
            return 3;
        }
    };
    for (title, symbols, range) in rows {
        match range {
            Ok(r) => {
                let (asset, currency) =
                    symbols.unwrap_or_else(|| ("asset".into(), "currency".into()));
                let _ = writeln!(out, "Trader {title}:");
                let _ = writeln!(out, "\tAssets:\t\t\t{} {asset}", r.assets);
                let _ = writeln!(out, "\tAssets value:\t\t{} {currency}", r.value);
                let _ = writeln!(out, "\tAvailable assets:\t{} {asset}", r.avail_assets);
                let _ = writeln!(out, "\tAvailable money:\t{} {currency}", r.avail_money);
                let _ = writeln!(out, "\tMin price:\t\t{} {currency}", r.min_price);
                let _ = writeln!(out, "\tMax price:\t\t{} {currency}", r.max_price);
            }
            Err(e) => {
                let _ = writeln!(out, "Trader {title}: {e}");
            }
        }
    }
    0
}

fn get_all_pairs(app: &App, args: &[String], out: &mut dyn Write) -> i32 {
    let Some(broker) = args.first().cloned() else {
        let _ = writeln!(out, "Append argument: <broker>");
        return 1;
    };
    let state = app.state();
    let result = run_guarded(app, move || {
        let state = state.lock();
        state
            .selector
            .get(&broker)
            .map(|stock| stock.lock().all_pairs())
    });
    match result {
        Ok(Some(Ok(pairs))) => {
            for pair in pairs {
                let _ = writeln!(out, "{pair}");
            }
            0
        }
        Ok(Some(Err(e))) => {
            let _ = writeln!(out, "{e}");
            3
        }
        Ok(None) => {
            let _ = writeln!(out, "Stock is not defined");
            2
        }
        Err(msg) => {
            let _ = writeln!(out, "{msg}");
            3
        }
    }
}

fn erase_trade(app: &App, args: &[String], out: &mut dyn Write, trunc: bool) -> i32 {
    let (Some(ident), Some(id_raw)) = (args.first().cloned(), args.get(1)) else {
        let _ = writeln!(out, "Need arguments: <trader_ident> <trade_id>");
        return 1;
    };
    let Ok(id) = id_raw.parse::<u64>() else {
        let _ = writeln!(out, "Trade id must be a number: {id_raw}");
        return 1;
    };
    let state = app.state();
    let shown = ident.clone();
    let result = run_guarded(app, move || {
        let mut state = state.lock();
        state
            .find_trader(&ident)
            .map(|t| t.erase_trade(id, trunc))
    });
    match result {
        Ok(Some(Ok(true))) => {
            let _ = writeln!(out, "OK");
            0
        }
        Ok(Some(Ok(false))) => {
            let _ = writeln!(out, "Trade not found: {id}");
            2
        }
        Ok(Some(Err(e))) => {
            let _ = writeln!(out, "{e}");
            3
        }
        Ok(None) => {
            let _ = writeln!(out, "Trader identification is invalid: {shown}");
            2
        }
        Err(msg) => {
            let _ = writeln!(out, "{msg}");
            3
        }
    }
}

fn single_trader_op(
    app: &App,
    args: &[String],
    out: &mut dyn Write,
    op: impl FnOnce(&mut pmm_trader::Trader) -> pmm_trader::Result<()> + Send + 'static,
) -> i32 {
    let Some(ident) = args.first().cloned() else {
        let _ = writeln!(out, "Need argument: <trader_ident>");
        return 1;
    };
    let state = app.state();
    let shown = ident.clone();
    let result = run_guarded(app, move || {
        let mut state = state.lock();
        state.find_trader(&ident).map(op)
    });
    match result {
        Ok(Some(Ok(()))) => {
            let _ = writeln!(out, "OK");
            0
        }
        Ok(Some(Err(e))) => {
            let _ = writeln!(out, "{e}");
            3
        }
        Ok(None) => {
            let _ = writeln!(out, "Trader identification is invalid: {shown}");
            2
        }
        Err(msg) => {
            let _ = writeln!(out, "{msg}");
            3
        }
    }
}

fn achieve(app: &App, args: &[String], out: &mut dyn Write) -> i32 {
    let (Some(ident), Some(price_raw), Some(balance_raw)) =
        (args.first().cloned(), args.get(1), args.get(2))
    else {
        let _ = writeln!(out, "Need arguments: <trader_ident> <price> <balance>");
        return 1;
    };
    let (Ok(price), Ok(balance)) = (
        price_raw.parse::<Decimal>(),
        balance_raw.parse::<Decimal>(),
    ) else {
        let _ = writeln!(out, "Price and balance must be numbers. Use dot (.) as decimal point");
        return 1;
    };
    if price <= Decimal::ZERO {
        let _ = writeln!(out, "Price must be a positive number");
        return 1;
    }
    single_trader_op(app, &args[..1], out, move |t| {
        t.achieve(Price::new(price), Size::new(balance))
    })
}

/// `io::Write` over an mpsc channel; lets the backtest stream its
/// progress dots from the worker back to the control connection.
struct ChannelWriter(mpsc::Sender<Vec<u8>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client hung up"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn backtest(app: &App, args: &[String], out: &mut dyn Write) -> i32 {
    let Some(ident) = args.first().cloned() else {
        let _ = writeln!(out, "Need arguments: <trader_ident> [option=value ...]");
        return 1;
    };
    let mut overrides = Vec::new();
    for arg in &args[1..] {
        let Some((key, value)) = arg.split_once('=') else {
            let _ = writeln!(out, "Options must be key=value: {arg}");
            return 1;
        };
        overrides.push((key.to_string(), value.to_string()));
    }

    let state = app.state();
    let report = app.report();
    let (dot_tx, dot_rx) = mpsc::channel::<Vec<u8>>();
    let (done_tx, done_rx) = mpsc::channel::<Result<Option<String>, (String, i32)>>();

    app.worker().submit(move || {
        let result = (|| -> Result<Option<String>, (String, i32)> {
            let mut state = state.lock();
            let Some(trader) = state.find_trader(&ident) else {
                return Ok(Some(format!("Trader identification is invalid: {ident}")));
            };
            trader.init().map_err(|e| (e.to_string(), 3))?;
            let minfo = match trader.market_info().cloned() {
                Some(mi) => mi,
                None => trader.refresh_market_info().map_err(|e| (e.to_string(), 2))?,
            };
            let cfg = trader
                .config()
                .apply_overrides(overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .map_err(|e| (e.to_string(), 2))?;
            let journal = trader.journal();
            let chart: Vec<_> = journal.chart.iter().copied().collect();
            if chart.is_empty() {
                return Err(("trader has no chart yet, nothing to replay".into(), 2));
            }
            let mut bt = Backtest::new(
                &ident,
                cfg,
                minfo,
                chart,
                journal.last_spread,
                journal.internal_balance,
                journal.currency,
            )
            .map_err(|e| (e.to_string(), 2))?;

            let mut writer = ChannelWriter(dot_tx);
            bt.run(&mut writer, || report.gen_report())
                .map_err(|e| (e.to_string(), 3))?;
            report.push_trades(&ident, &bt.journal().trades);
            report.gen_report();
            Ok(None)
        })();
        let _ = done_tx.send(result);
    });

    // Stream dots until the worker is done; dropping the receiver
    // tells the backtest the client hung up.
    while let Ok(chunk) = dot_rx.recv() {
        if out.write_all(&chunk).and_then(|_| out.flush()).is_err() {
            break;
        }
    }
    drop(dot_rx);

    match done_rx.recv() {
        Ok(Ok(None)) => {
            let _ = writeln!(out, "\nOK");
            0
        }
        Ok(Ok(Some(message))) => {
            let _ = writeln!(out, "{message}");
            2
        }
        Ok(Err((message, code))) => {
            let _ = writeln!(out, "{message}");
            code
        }
        Err(_) => {
            let _ = writeln!(out, "backtest worker disappeared");
            3
        }
    }
}
