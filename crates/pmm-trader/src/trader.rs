//! The per-pair trading state machine.
//!
//! A cycle either commits all of its journal changes in one atomic
//! storage put or leaves the in-memory and on-disk state exactly as
//! it was. Exchange-side mutations (order placement) are inherently
//! uncommittable; the next cycle reconciles them from the adapter's
//! view.

use crate::config::TraderConfig;
use crate::error::{Result, TraderError};
use crate::spread::{SpreadCell, SpreadEstimator};
use crate::stats::{CycleSummary, StatsSink};
use crate::strategy::{compute_quotes, QuoteTarget};
use pmm_core::{Chart, MarketInfo, Order, Price, Size, Ticker, Trade};
use pmm_exchange::StockApi;
use pmm_storage::Storage;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Client-id tags marking the engine's own orders; replace-or-place
/// is keyed on them, which is what enforces the one-buy-one-sell
/// shape.
pub const BUY_TAG: &str = "buy";
pub const SELL_TAG: &str = "sell";

/// Persisted per-trader state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    /// Every reconciled trade since the last hard reset, id-ordered.
    pub trades: Vec<Trade>,
    /// The engine's model of its asset holding, relative to the
    /// journal start. May differ from the exchange-reported balance.
    pub internal_balance: Size,
    /// Modeled quote currency.
    pub currency: Decimal,
    /// Virtual quote accumulator used in margin mode.
    pub margin_currency: Decimal,
    /// Smoothed spread estimate, written back by the stats sink.
    pub last_spread: f64,
    pub chart: Chart,
    pub open_buy_id: Option<u64>,
    pub open_sell_id: Option<u64>,
    pub last_seen_trade_id: u64,
    /// Whether the initial currency balance has been read from the
    /// adapter.
    pub currency_read: bool,
}

impl Default for Journal {
    fn default() -> Self {
        Self {
            trades: Vec::new(),
            internal_balance: Size::ZERO,
            currency: Decimal::ZERO,
            margin_currency: Decimal::ZERO,
            last_spread: 0.0,
            chart: Chart::default(),
            open_buy_id: None,
            open_sell_id: None,
            last_seen_trade_id: 0,
            currency_read: false,
        }
    }
}

/// Result of `calc_range`: the price band the quoting ladder can
/// sustain from the available budgets.
#[derive(Debug, Clone, Serialize)]
pub struct RangeInfo {
    pub assets: Decimal,
    pub value: Decimal,
    pub avail_assets: Decimal,
    pub avail_money: Decimal,
    pub min_price: f64,
    pub max_price: f64,
}

pub struct Trader {
    ident: String,
    cfg: TraderConfig,
    stock: Box<dyn StockApi>,
    storage: Storage,
    stats: Box<dyn StatsSink>,
    spread_cell: SpreadCell,
    journal: Journal,
    minfo: Option<MarketInfo>,
    cycles: u64,
    initialized: bool,
}

impl Trader {
    pub fn new(
        ident: impl Into<String>,
        cfg: TraderConfig,
        stock: Box<dyn StockApi>,
        storage: Storage,
        stats: Box<dyn StatsSink>,
    ) -> Self {
        let ident = ident.into();
        Self {
            ident,
            cfg,
            stock,
            storage,
            stats,
            spread_cell: SpreadCell::default(),
            journal: Journal::default(),
            minfo: None,
            cycles: 0,
            initialized: false,
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn config(&self) -> &TraderConfig {
        &self.cfg
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn market_info(&self) -> Option<&MarketInfo> {
        self.minfo.as_ref()
    }

    /// Load the journal. Idempotent; `perform` calls it too.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if let Some(journal) = self.storage.load::<Journal>() {
            info!(
                trades = journal.trades.len(),
                balance = %journal.internal_balance,
                "journal loaded"
            );
            self.spread_cell.set(journal.last_spread);
            self.journal = journal;
        } else {
            self.journal.chart = Chart::new(self.cfg.chart_capacity);
        }
        self.initialized = true;
        Ok(())
    }

    /// Fetch and cache the market rules outside a cycle. The
    /// backtest command uses this when the trader has not performed
    /// yet.
    pub fn refresh_market_info(&mut self) -> Result<MarketInfo> {
        let pair = self.cfg.pair.clone();
        let minfo = self.stock.market_info(&pair)?;
        if minfo.asset_symbol.is_empty() || minfo.currency_symbol.is_empty() {
            return Err(TraderError::Structural(format!(
                "market info for {pair} has empty symbols"
            )));
        }
        self.minfo = Some(minfo.clone());
        Ok(minfo)
    }

    /// Start the model from an externally supplied state, as the
    /// backtest driver does with the live trader's snapshot.
    pub fn seed_model(&mut self, balance: Size, currency: Decimal, last_spread: f64) -> Result<()> {
        self.init()?;
        self.journal.internal_balance = balance;
        self.journal.currency = currency;
        self.journal.currency_read = true;
        self.journal.last_spread = last_spread;
        self.spread_cell.set(last_spread);
        Ok(())
    }

    /// One trading cycle. Returns whether any trade was reconciled.
    pub fn perform(&mut self) -> Result<bool> {
        self.init()?;
        let pair = self.cfg.pair.clone();

        // Refresh market rules.
        let minfo = self.refresh_market_info()?;

        // Everything below mutates a working copy; only a successful
        // storage put swaps it in.
        let mut working = self.journal.clone();

        if !working.currency_read {
            working.currency = match self.stock.balance(&minfo.currency_symbol) {
                Ok(v) => v,
                Err(e) => {
                    warn!(symbol = %minfo.currency_symbol, error = %e, "currency balance unavailable, starting at 0");
                    Decimal::ZERO
                }
            };
            working.currency_read = true;
        }

        // Read the ticker, grow the chart, pick up the latest spread.
        let ticker = self.stock.ticker(&pair)?;
        working.chart.push(ticker);
        let cell = self.spread_cell.get();
        if cell > 0.0 {
            working.last_spread = cell;
        }
        self.cycles += 1;
        if self.cfg.spread_calc_interval > 0 && self.cycles % self.cfg.spread_calc_interval == 0 {
            self.defer_spread_recalc(&working, &minfo, ticker.last);
        }

        // Ingest new trades.
        let from_time = working.trades.last().map(|t| t.time_ms).unwrap_or(0);
        let fetched = self
            .stock
            .trades(working.last_seen_trade_id, from_time, &pair)?;
        let mut ingested = Vec::new();
        for trade in fetched {
            if working.last_seen_trade_id != 0 && trade.id <= working.last_seen_trade_id {
                warn!(trade_id = trade.id, last_seen = working.last_seen_trade_id, "trade id not after last seen, skipping");
                continue;
            }
            if working.trades.iter().any(|t| t.id == trade.id) {
                warn!(trade_id = trade.id, "trade already journaled, skipping");
                continue;
            }
            apply_fill(&mut working, &trade, minfo.is_margin());
            working.last_seen_trade_id = trade.id;
            working.trades.push(trade.clone());
            ingested.push(trade);
        }
        if !ingested.is_empty() {
            info!(count = ingested.len(), balance = %working.internal_balance, "trades reconciled");
        }

        // Reconcile our outstanding orders with the exchange's view.
        let open = self.stock.open_orders(&pair)?;
        let buy_current = resolve_order(&open, working.open_buy_id, BUY_TAG);
        let sell_current = resolve_order(&open, working.open_sell_id, SELL_TAG);
        if working.open_buy_id.is_some() && buy_current.is_none() && ingested.is_empty() {
            warn!(order_id = ?working.open_buy_id, "buy order vanished without a matching trade");
        }
        if working.open_sell_id.is_some() && sell_current.is_none() && ingested.is_empty() {
            warn!(order_id = ?working.open_sell_id, "sell order vanished without a matching trade");
        }

        // New targets from the strategy.
        let floor = self.spread_floor(&minfo, ticker.last);
        let spread = working.last_spread.max(floor);
        let targets = compute_quotes(&minfo, ticker.last, working.internal_balance, spread, &self.cfg);

        // Replace-or-place each side.
        working.open_buy_id = self.apply_side(&pair, &minfo, buy_current, targets.buy, BUY_TAG)?;
        working.open_sell_id =
            self.apply_side(&pair, &minfo, sell_current, targets.sell, SELL_TAG)?;

        // Atomic commit, then the deferred report.
        self.storage.put(&working)?;
        let summary = CycleSummary {
            ident: self.ident.clone(),
            title: self.title(),
            pair: pair.clone(),
            ticker,
            buy: targets.buy,
            sell: targets.sell,
            internal_balance: working.internal_balance,
            currency: working.currency,
            trade_count: working.trades.len(),
            new_trades: ingested.clone(),
            last_spread: working.last_spread,
        };
        self.journal = working;
        self.stats.report_cycle(summary);
        Ok(!ingested.is_empty())
    }

    fn title(&self) -> String {
        if self.cfg.title.is_empty() {
            self.ident.clone()
        } else {
            self.cfg.title.clone()
        }
    }

    fn defer_spread_recalc(&self, working: &Journal, minfo: &MarketInfo, last: Price) {
        let estimator = SpreadEstimator::new(self.cfg.spread_window, self.cfg.spread_alpha);
        let chart = working.chart.clone();
        let prev = working.last_spread;
        let floor = self.spread_floor(minfo, last);
        let cell = self.spread_cell.clone();
        self.stats.defer(Box::new(move || {
            let spread = estimator.estimate(&chart, prev, floor);
            debug!(spread, "spread recalculated");
            cell.set(spread);
        }));
    }

    /// The spread never quotes inside round-trip costs.
    fn spread_floor(&self, minfo: &MarketInfo, last: Price) -> f64 {
        let fees = minfo.fees.to_f64().unwrap_or(0.0) * 2.0;
        let step = if last.is_positive() {
            minfo.price_step.to_f64() / last.to_f64()
        } else {
            0.0
        };
        (fees + step).max(self.cfg.min_spread)
    }

    /// Bring one side's resting order to its target. Retries a lost
    /// replace race once after refetching orders.
    fn apply_side(
        &mut self,
        pair: &str,
        minfo: &MarketInfo,
        mut current: Option<Order>,
        target: Option<QuoteTarget>,
        tag: &str,
    ) -> Result<Option<u64>> {
        for attempt in 0..2 {
            match (&current, &target) {
                (None, None) => return Ok(None),
                (Some(cur), Some(t)) if order_matches(cur, t, minfo) => return Ok(Some(cur.id)),
                _ => {}
            }
            let (size, price) = match &target {
                Some(t) => (t.size, t.price),
                None => (Size::ZERO, Price::ZERO),
            };
            let replace_id = current.as_ref().map(|o| o.id);
            let replace_size = current
                .as_ref()
                .map(|o| o.size.abs())
                .unwrap_or(Size::ZERO);
            let placed =
                self.stock
                    .place_order(pair, size, price, Some(tag), replace_id, replace_size)?;
            match placed {
                Some(id) => {
                    return Ok(target.map(|_| id));
                }
                None => {
                    debug!(side = tag, attempt, "replace race lost, refetching orders");
                    let open = self.stock.open_orders(pair)?;
                    current = open
                        .into_iter()
                        .find(|o| o.client_id.as_deref() == Some(tag));
                }
            }
        }
        Err(TraderError::ReplaceRace)
    }

    /// Drop all trades but the newest one and rebuild the balance
    /// from it. Exchange orders are left alone.
    pub fn reset(&mut self) -> Result<()> {
        self.init()?;
        let mut working = self.journal.clone();
        let keep = working.trades.last().cloned();
        working.trades = keep.iter().cloned().collect();
        working.internal_balance = keep.map(|t| t.eff_size).unwrap_or(Size::ZERO);
        self.storage.put(&working)?;
        info!(balance = %working.internal_balance, "journal reset");
        self.journal = working;
        Ok(())
    }

    /// Recompute the balance from the journal and drop stale order
    /// ids.
    pub fn repair(&mut self) -> Result<()> {
        self.init()?;
        let mut working = self.journal.clone();
        working.internal_balance = working
            .trades
            .iter()
            .fold(Size::ZERO, |acc, t| acc + t.eff_size);
        working.last_seen_trade_id = working.trades.last().map(|t| t.id).unwrap_or(0);
        working.open_buy_id = None;
        working.open_sell_id = None;
        self.storage.put(&working)?;
        info!(balance = %working.internal_balance, "journal repaired");
        self.journal = working;
        Ok(())
    }

    /// Inject a synthetic fill bringing the model to the target
    /// state without touching the exchange.
    pub fn achieve(&mut self, price: Price, balance: Size) -> Result<()> {
        self.init()?;
        if !price.is_positive() {
            return Err(TraderError::Config("achieve price must be positive".into()));
        }
        let mut working = self.journal.clone();
        let delta = balance - working.internal_balance;
        if delta.is_zero() {
            return Ok(());
        }
        let id = working
            .last_seen_trade_id
            .max(working.trades.last().map(|t| t.id).unwrap_or(0))
            + 1;
        let trade = Trade {
            id,
            time_ms: chrono::Utc::now().timestamp_millis(),
            size: delta,
            price,
            eff_size: delta,
            eff_price: price,
        };
        let margin = self.minfo.as_ref().map(|m| m.is_margin()).unwrap_or(false);
        if margin {
            working.margin_currency -= delta.inner() * price.inner();
        } else {
            working.currency -= delta.inner() * price.inner();
        }
        working.internal_balance = balance;
        working.trades.push(trade);
        working.last_seen_trade_id = id;
        self.storage.put(&working)?;
        info!(%price, %balance, "achieved internal state");
        self.journal = working;
        Ok(())
    }

    /// Remove one trade by id; with `trunc` also every newer trade.
    /// Returns false when the id is unknown.
    pub fn erase_trade(&mut self, id: u64, trunc: bool) -> Result<bool> {
        self.init()?;
        let mut working = self.journal.clone();
        let Some(pos) = working.trades.iter().position(|t| t.id == id) else {
            return Ok(false);
        };
        if trunc {
            working.trades.truncate(pos);
        } else {
            working.trades.remove(pos);
        }
        working.internal_balance = working
            .trades
            .iter()
            .fold(Size::ZERO, |acc, t| acc + t.eff_size);
        // Re-sync point: the adapter will re-deliver anything newer.
        working.last_seen_trade_id = working.trades.last().map(|t| t.id).unwrap_or(0);
        self.storage.put(&working)?;
        info!(trade_id = id, trunc, remaining = working.trades.len(), "trade erased");
        self.journal = working;
        Ok(true)
    }

    /// The price band the quoting ladder can ride with the available
    /// budgets.
    pub fn calc_range(&mut self) -> Result<RangeInfo> {
        self.init()?;
        let pair = self.cfg.pair.clone();
        let minfo = match &self.minfo {
            Some(mi) => mi.clone(),
            None => {
                let mi = self.stock.market_info(&pair)?;
                self.minfo = Some(mi.clone());
                mi
            }
        };
        let ticker = self.stock.ticker(&pair)?;
        let last = ticker.last.to_f64();

        let assets = self.journal.internal_balance.inner();
        let avail_assets = self
            .stock
            .balance(&minfo.asset_symbol)
            .unwrap_or(assets);
        let avail_money = self
            .stock
            .balance(&minfo.currency_symbol)
            .unwrap_or(self.journal.currency);

        let sigma = self
            .journal
            .last_spread
            .max(self.spread_floor(&minfo, ticker.last));
        let step_size = self.cfg.order_size.to_f64().unwrap_or(0.0);
        let money = avail_money.to_f64().unwrap_or(0.0);
        let asset_steps = if step_size > 0.0 {
            avail_assets.to_f64().unwrap_or(0.0).max(0.0) / step_size
        } else {
            0.0
        };

        // Riding the ladder down costs sigma/step_size currency per
        // unit of price; riding up is bounded by the asset budget.
        let min_price = if step_size > 0.0 {
            (last - money * sigma / step_size).max(0.0)
        } else {
            last
        };
        let max_price = last * (1.0 + sigma).powf(asset_steps);

        Ok(RangeInfo {
            assets,
            value: assets * ticker.last.inner(),
            avail_assets,
            avail_money,
            min_price,
            max_price,
        })
    }
}

/// Mirror one fill into the position model.
fn apply_fill(journal: &mut Journal, trade: &Trade, margin: bool) {
    if margin {
        let balance = journal.internal_balance.inner();
        if !balance.is_zero() {
            let open_price = journal.margin_currency / balance;
            journal.currency += balance * (trade.price.inner() - open_price);
        }
        journal.margin_currency +=
            journal.margin_currency - trade.size.inner() * trade.price.inner();
    } else {
        journal.currency -= trade.eff_size.inner() * trade.eff_price.inner();
    }
    journal.internal_balance += trade.eff_size;
}

/// Find our order for a side: by remembered id first, then by the
/// client tag (covers restarts that lost the id).
fn resolve_order(open: &[Order], known_id: Option<u64>, tag: &str) -> Option<Order> {
    known_id
        .and_then(|id| open.iter().find(|o| o.id == id))
        .or_else(|| open.iter().find(|o| o.client_id.as_deref() == Some(tag)))
        .cloned()
}

/// A live order already at its target, within one step of tolerance.
fn order_matches(current: &Order, target: &QuoteTarget, minfo: &MarketInfo) -> bool {
    let price_diff = (current.price.inner() - target.price.inner()).abs();
    let size_diff = (current.size.inner() - target.size.inner()).abs();
    price_diff <= minfo.price_step.inner() && size_diff <= minfo.size_step.inner()
}
