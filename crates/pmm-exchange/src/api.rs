//! The uniform pair-trading interface every adapter presents.

use parking_lot::Mutex;
use pmm_core::{MarketInfo, Order, Price, Size, Ticker, Trade};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;

/// Adapter failure kinds.
///
/// The cycle engine treats `Transient` as retry-next-tick and
/// `Protocol` as a structural fault worth an error-level log; both
/// are caught at the cycle boundary and never cross into the
/// scheduler.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient adapter failure: {0}")]
    Transient(String),

    #[error("adapter protocol error: {0}")]
    Protocol(String),

    #[error("{0} is not supported by this adapter")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

/// A pair-trading exchange adapter.
///
/// Live subprocess brokers, the emulator, and the backtest replay
/// feed all satisfy this surface; the trader never knows which one
/// it is talking to.
pub trait StockApi: Send {
    fn market_info(&mut self, pair: &str) -> Result<MarketInfo>;

    fn ticker(&mut self, pair: &str) -> Result<Ticker>;

    /// Balance of one symbol. Fails when the adapter cannot report it.
    fn balance(&mut self, symbol: &str) -> Result<Decimal>;

    fn open_orders(&mut self, pair: &str) -> Result<Vec<Order>>;

    /// Trades strictly after `last_seen_id`, in time order.
    fn trades(&mut self, last_seen_id: u64, from_time_ms: i64, pair: &str) -> Result<Vec<Trade>>;

    /// Place, replace, or cancel an order.
    ///
    /// With `replace_id` set, the adapter atomically (from the
    /// caller's view) cancels the matching live order and places the
    /// new one, provided the order still has at least `replace_size`
    /// remaining; `Ok(None)` signals the replace race was lost and
    /// the caller must refetch its orders. A zero `size` with a
    /// `replace_id` is a pure cancel.
    #[allow(clippy::too_many_arguments)]
    fn place_order(
        &mut self,
        pair: &str,
        size: Size,
        price: Price,
        client_id: Option<&str>,
        replace_id: Option<u64>,
        replace_size: Size,
    ) -> Result<Option<u64>>;

    fn fees(&mut self, pair: &str) -> Result<Decimal>;

    fn all_pairs(&mut self) -> Result<Vec<String>>;

    /// Invalidate per-tick caches. Returning `false` aborts the tick.
    fn reset(&mut self) -> Result<bool>;

    fn is_test(&self) -> bool;
}

/// A broker shared between the registry and the traders using it.
pub type SharedStock = Arc<Mutex<Box<dyn StockApi>>>;

/// `StockApi` view over a [`SharedStock`], locking per call.
///
/// Lets an [`crate::Emulator`] own a handle to a broker that the
/// registry also owns.
pub struct SharedStockApi(pub SharedStock);

impl StockApi for SharedStockApi {
    fn market_info(&mut self, pair: &str) -> Result<MarketInfo> {
        self.0.lock().market_info(pair)
    }

    fn ticker(&mut self, pair: &str) -> Result<Ticker> {
        self.0.lock().ticker(pair)
    }

    fn balance(&mut self, symbol: &str) -> Result<Decimal> {
        self.0.lock().balance(symbol)
    }

    fn open_orders(&mut self, pair: &str) -> Result<Vec<Order>> {
        self.0.lock().open_orders(pair)
    }

    fn trades(&mut self, last_seen_id: u64, from_time_ms: i64, pair: &str) -> Result<Vec<Trade>> {
        self.0.lock().trades(last_seen_id, from_time_ms, pair)
    }

    fn place_order(
        &mut self,
        pair: &str,
        size: Size,
        price: Price,
        client_id: Option<&str>,
        replace_id: Option<u64>,
        replace_size: Size,
    ) -> Result<Option<u64>> {
        self.0
            .lock()
            .place_order(pair, size, price, client_id, replace_id, replace_size)
    }

    fn fees(&mut self, pair: &str) -> Result<Decimal> {
        self.0.lock().fees(pair)
    }

    fn all_pairs(&mut self) -> Result<Vec<String>> {
        self.0.lock().all_pairs()
    }

    fn reset(&mut self) -> Result<bool> {
        self.0.lock().reset()
    }

    fn is_test(&self) -> bool {
        self.0.lock().is_test()
    }
}
