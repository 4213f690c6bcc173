//! Backtest driver.
//!
//! Replays a trader's recorded chart through an emulator, running
//! the unmodified cycle engine against each sample. The emulator id
//! seed is pinned, so replaying the same chart with the same config
//! produces the same final journal.

use crate::config::TraderConfig;
use crate::error::Result;
use crate::stats::NullStats;
use crate::trader::{Journal, Trader};
use pmm_core::{MarketInfo, Size, Ticker};
use pmm_exchange::{Emulator, ReplayHandle, ReplaySource};
use pmm_storage::{Format, Storage};
use rust_decimal::Decimal;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::info;

/// Progress dot cadence, in steps.
const DOT_EVERY: usize = 60;
/// Report regeneration cadence.
const REPORT_EVERY: Duration = Duration::from_secs(15);

pub struct Backtest {
    trader: Trader,
    handle: ReplayHandle,
    done: bool,
}

impl Backtest {
    /// Build a replaying trader seeded with the live trader's chart,
    /// spread, and position model.
    pub fn new(
        ident: &str,
        cfg: TraderConfig,
        minfo: MarketInfo,
        chart: Vec<Ticker>,
        last_spread: f64,
        internal_balance: Size,
        currency: Decimal,
    ) -> Result<Self> {
        let pair = cfg.pair.clone();
        let (source, handle) = ReplaySource::new(pair, minfo, chart);
        let mut emulator = Emulator::with_id_seed(Box::new(source), cfg.initial_currency, 0);
        emulator.set_balances(internal_balance.inner(), currency);

        let storage = Storage::memory(Format::Binary);
        let mut trader = Trader::new(ident, cfg, Box::new(emulator), storage, Box::new(NullStats));
        trader.init()?;
        // The replayed trader starts from the live model, not from
        // an empty journal.
        let done = handle.is_empty();
        let mut bt = Self {
            trader,
            handle,
            done,
        };
        bt.seed(internal_balance, currency, last_spread)?;
        Ok(bt)
    }

    fn seed(&mut self, balance: Size, currency: Decimal, last_spread: f64) -> Result<()> {
        if balance.is_zero() && currency.is_zero() && last_spread == 0.0 {
            return Ok(());
        }
        self.trader
            .seed_model(balance, currency, last_spread)
    }

    /// Run one cycle against the current sample, then advance.
    /// Returns false once the chart is exhausted.
    pub fn step(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        self.trader.perform()?;
        if !self.handle.step() {
            self.done = true;
        }
        Ok(true)
    }

    /// Drive the whole chart, writing a progress dot to `out` every
    /// 60 steps (aborting when the client hangs up) and invoking
    /// `on_report` every 15 wall-clock seconds.
    pub fn run(&mut self, out: &mut dyn Write, mut on_report: impl FnMut()) -> Result<()> {
        let mut since_dot = 0usize;
        let mut last_report = Instant::now();
        while self.step()? {
            since_dot += 1;
            if since_dot >= DOT_EVERY {
                since_dot = 0;
                if out.write_all(b".").and_then(|_| out.flush()).is_err() {
                    info!("backtest client hung up, stopping");
                    break;
                }
            }
            if last_report.elapsed() >= REPORT_EVERY {
                on_report();
                last_report = Instant::now();
            }
        }
        on_report();
        Ok(())
    }

    pub fn journal(&self) -> &Journal {
        self.trader.journal()
    }

    pub fn trader(&self) -> &Trader {
        &self.trader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm_core::{FeeScheme, Price};
    use rust_decimal_macros::dec;

    fn minfo() -> MarketInfo {
        MarketInfo {
            asset_symbol: "BTC".into(),
            currency_symbol: "USD".into(),
            min_size: Size::new(dec!(0.001)),
            size_step: Size::new(dec!(0.001)),
            price_step: Price::new(dec!(0.01)),
            fees: dec!(0),
            leverage: dec!(0),
            fee_scheme: FeeScheme::Currency,
        }
    }

    fn cfg() -> TraderConfig {
        serde_json::from_value(serde_json::json!({
            "broker": "emu",
            "pair": "BTCUSD",
            "order_size": "1",
            "min_spread": 0.02,
            "spread_calc_interval": 5,
        }))
        .unwrap()
    }

    /// A wavy 1000-sample chart.
    fn chart() -> Vec<Ticker> {
        (0..1000)
            .map(|i| {
                let phase = (i as f64 / 40.0).sin();
                let price = 100.0 + 5.0 * phase;
                let d = Decimal::from_f64_retain((price * 100.0).round() / 100.0).unwrap();
                Ticker::new(Price::new(d), Price::new(d), Price::new(d), i as i64 * 60_000)
            })
            .collect()
    }

    fn run_once() -> Vec<u8> {
        let mut bt = Backtest::new(
            "bt",
            cfg(),
            minfo(),
            chart(),
            0.02,
            Size::ZERO,
            dec!(1000),
        )
        .unwrap();
        let mut sink = Vec::new();
        bt.run(&mut sink, || {}).unwrap();
        // Byte-level comparison of the final journal.
        bincode::serialize(bt.journal()).unwrap()
    }

    #[test]
    fn test_backtest_trades_and_is_deterministic() {
        let a = run_once();
        let b = run_once();
        assert_eq!(a, b, "replays of the same chart must match byte for byte");

        let journal: Journal = bincode::deserialize(&a).unwrap();
        assert!(
            !journal.trades.is_empty(),
            "a wavy chart should produce fills"
        );
        // Max trade id is monotone over the journal.
        let ids: Vec<u64> = journal.trades.iter().map(|t| t.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids.len(), sorted.len(), "trade ids must be unique");

        // Balance matches the sum of effective sizes.
        let total: Decimal = journal.trades.iter().map(|t| t.eff_size.inner()).sum();
        assert_eq!(journal.internal_balance.inner(), total);
    }

    #[test]
    fn test_progress_dots_every_sixty_steps() {
        let mut bt = Backtest::new(
            "bt",
            cfg(),
            minfo(),
            chart(),
            0.02,
            Size::ZERO,
            dec!(1000),
        )
        .unwrap();
        let mut sink = Vec::new();
        bt.run(&mut sink, || {}).unwrap();
        // 1000 steps → 16 dots.
        assert_eq!(sink.len(), 1000 / 60);
    }
}
