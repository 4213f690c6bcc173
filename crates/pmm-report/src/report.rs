//! The aggregate report model.
//!
//! One panel per trader plus a bounded recent-trade list. Updates
//! arrive on the action queue; `gen_report` renders the whole thing
//! into storage where the HTTP server picks it up.

use chrono::Utc;
use parking_lot::Mutex;
use pmm_core::Trade;
use pmm_sched::ActionQueue;
use pmm_storage::Storage;
use pmm_trader::{CycleSummary, QuoteTarget, StatsSink};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
struct QuoteRow {
    price: Decimal,
    size: Decimal,
}

impl From<QuoteTarget> for QuoteRow {
    fn from(q: QuoteTarget) -> Self {
        Self {
            price: q.price.inner(),
            size: q.size.inner(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct TradeRow {
    trader: String,
    id: u64,
    time_ms: i64,
    size: Decimal,
    price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
struct Panel {
    ident: String,
    title: String,
    pair: String,
    last_price: Decimal,
    position: Decimal,
    currency: Decimal,
    trade_count: usize,
    last_spread: f64,
    buy: Option<QuoteRow>,
    sell: Option<QuoteRow>,
    updated_ms: i64,
}

#[derive(Default)]
struct State {
    panels: BTreeMap<String, Panel>,
    recent_trades: Vec<TradeRow>,
}

/// Shared by all traders; mutated only through the action queue.
pub struct Report {
    storage: Storage,
    /// Trades older than this window fall off the report.
    interval_ms: i64,
    /// Render positions with the sign flipped (asset-to-negative-
    /// position display toggle).
    a2np: bool,
    state: Mutex<State>,
}

impl Report {
    pub fn new(storage: Storage, interval_ms: i64, a2np: bool) -> Self {
        Self {
            storage,
            interval_ms,
            a2np,
            state: Mutex::new(State::default()),
        }
    }

    /// Fold one cycle summary into the report model.
    pub fn update(&self, summary: CycleSummary) {
        let mut state = self.state.lock();
        let position = if self.a2np {
            -summary.internal_balance.inner()
        } else {
            summary.internal_balance.inner()
        };
        state.panels.insert(
            summary.ident.clone(),
            Panel {
                ident: summary.ident.clone(),
                title: summary.title,
                pair: summary.pair,
                last_price: summary.ticker.last.inner(),
                position,
                currency: summary.currency,
                trade_count: summary.trade_count,
                last_spread: summary.last_spread,
                buy: summary.buy.map(Into::into),
                sell: summary.sell.map(Into::into),
                updated_ms: summary.ticker.time_ms,
            },
        );
        for trade in &summary.new_trades {
            state.recent_trades.push(TradeRow {
                trader: summary.ident.clone(),
                id: trade.id,
                time_ms: trade.time_ms,
                size: trade.size.inner(),
                price: trade.price.inner(),
            });
        }
        let cutoff = Utc::now().timestamp_millis() - self.interval_ms;
        state.recent_trades.retain(|t| t.time_ms >= cutoff);
    }

    /// Record an out-of-band trade row (backtest fills).
    pub fn push_trades(&self, trader: &str, trades: &[Trade]) {
        let mut state = self.state.lock();
        for trade in trades {
            state.recent_trades.push(TradeRow {
                trader: trader.to_string(),
                id: trade.id,
                time_ms: trade.time_ms,
                size: trade.size.inner(),
                price: trade.price.inner(),
            });
        }
    }

    /// Render the report into storage.
    pub fn gen_report(&self) {
        #[derive(Serialize)]
        struct Rendered<'a> {
            generated_ms: i64,
            traders: Vec<&'a Panel>,
            recent_trades: &'a [TradeRow],
        }

        let state = self.state.lock();
        let rendered = Rendered {
            generated_ms: Utc::now().timestamp_millis(),
            traders: state.panels.values().collect(),
            recent_trades: &state.recent_trades,
        };
        if let Err(e) = self.storage.put(&rendered) {
            error!(error = %e, "report write failed");
        } else {
            info!(traders = state.panels.len(), "report generated");
        }
    }
}

/// The production stats sink: everything lands on the action queue,
/// so report folding and spread math stay off the trading path.
pub struct QueuedStats {
    queue: ActionQueue,
    report: Arc<Report>,
}

impl QueuedStats {
    pub fn new(queue: ActionQueue, report: Arc<Report>) -> Self {
        Self { queue, report }
    }
}

impl StatsSink for QueuedStats {
    fn report_cycle(&self, summary: CycleSummary) {
        let report = self.report.clone();
        self.queue.push(move || report.update(summary));
    }

    fn defer(&self, job: Box<dyn FnOnce() + Send>) {
        self.queue.push(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm_core::{Price, Size, Ticker};
    use pmm_storage::Format;
    use rust_decimal_macros::dec;

    fn summary(ident: &str, balance: Decimal) -> CycleSummary {
        let now = Utc::now().timestamp_millis();
        CycleSummary {
            ident: ident.into(),
            title: ident.to_uppercase(),
            pair: "BTCUSD".into(),
            ticker: Ticker::new(
                Price::new(dec!(99)),
                Price::new(dec!(101)),
                Price::new(dec!(100)),
                now,
            ),
            buy: None,
            sell: None,
            internal_balance: Size::new(balance),
            currency: dec!(900),
            trade_count: 3,
            new_trades: vec![Trade {
                id: 1,
                time_ms: now,
                size: Size::new(dec!(1)),
                price: Price::new(dec!(100)),
                eff_size: Size::new(dec!(1)),
                eff_price: Price::new(dec!(100)),
            }],
            last_spread: 0.01,
        }
    }

    #[test]
    fn test_update_then_render() {
        let report = Report::new(Storage::memory(Format::Json), 864_000_000, false);
        report.update(summary("btc", dec!(2)));
        report.update(summary("eth", dec!(1)));
        report.gen_report();

        let rendered: serde_json::Value = report.storage.load().unwrap();
        let traders = rendered["traders"].as_array().unwrap();
        assert_eq!(traders.len(), 2);
        assert_eq!(traders[0]["ident"], "btc");
        assert_eq!(traders[0]["position"], "2");
        assert_eq!(rendered["recent_trades"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_a2np_flips_position_sign() {
        let report = Report::new(Storage::memory(Format::Json), 864_000_000, true);
        report.update(summary("btc", dec!(2)));
        report.gen_report();
        let rendered: serde_json::Value = report.storage.load().unwrap();
        assert_eq!(rendered["traders"][0]["position"], "-2");
    }

    #[test]
    fn test_old_trades_fall_out_of_window() {
        let report = Report::new(Storage::memory(Format::Json), 1, false);
        let mut s = summary("btc", dec!(1));
        s.new_trades[0].time_ms = 0; // far in the past
        report.update(s);
        report.gen_report();
        let rendered: serde_json::Value = report.storage.load().unwrap();
        assert_eq!(rendered["recent_trades"].as_array().unwrap().len(), 0);
    }
}
