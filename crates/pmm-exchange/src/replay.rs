//! Historical chart feed.
//!
//! Walks a recorded ticker series one sample at a time; the driver
//! holds a [`ReplayHandle`] to advance the cursor while the emulator
//! reads the current sample through the [`StockApi`] surface.

use crate::api::{ExchangeError, Result, StockApi};
use pmm_core::{MarketInfo, Order, Price, Size, Ticker, Trade};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    samples: Vec<Ticker>,
    cursor: AtomicUsize,
}

pub struct ReplaySource {
    shared: Arc<Shared>,
    minfo: MarketInfo,
    pair: String,
}

/// Advances the replay cursor.
pub struct ReplayHandle {
    shared: Arc<Shared>,
}

impl ReplayHandle {
    /// Move to the next sample. Returns false when exhausted.
    pub fn step(&self) -> bool {
        let cur = self.shared.cursor.load(Ordering::Relaxed);
        if cur + 1 >= self.shared.samples.len() {
            return false;
        }
        self.shared.cursor.store(cur + 1, Ordering::Relaxed);
        true
    }

    pub fn position(&self) -> usize {
        self.shared.cursor.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.samples.is_empty()
    }
}

impl ReplaySource {
    pub fn new(
        pair: impl Into<String>,
        minfo: MarketInfo,
        samples: Vec<Ticker>,
    ) -> (Self, ReplayHandle) {
        let shared = Arc::new(Shared {
            samples,
            cursor: AtomicUsize::new(0),
        });
        (
            Self {
                shared: shared.clone(),
                minfo,
                pair: pair.into(),
            },
            ReplayHandle { shared },
        )
    }
}

impl StockApi for ReplaySource {
    fn market_info(&mut self, _pair: &str) -> Result<MarketInfo> {
        Ok(self.minfo.clone())
    }

    fn ticker(&mut self, _pair: &str) -> Result<Ticker> {
        let cur = self.shared.cursor.load(Ordering::Relaxed);
        self.shared
            .samples
            .get(cur)
            .copied()
            .ok_or_else(|| ExchangeError::Transient("replay chart exhausted".into()))
    }

    fn balance(&mut self, _symbol: &str) -> Result<Decimal> {
        Err(ExchangeError::Unsupported("balance"))
    }

    fn open_orders(&mut self, _pair: &str) -> Result<Vec<Order>> {
        Err(ExchangeError::Unsupported("open_orders"))
    }

    fn trades(&mut self, _last_seen_id: u64, _from_time_ms: i64, _pair: &str) -> Result<Vec<Trade>> {
        Err(ExchangeError::Unsupported("trades"))
    }

    fn place_order(
        &mut self,
        _pair: &str,
        _size: Size,
        _price: Price,
        _client_id: Option<&str>,
        _replace_id: Option<u64>,
        _replace_size: Size,
    ) -> Result<Option<u64>> {
        Err(ExchangeError::Unsupported("place_order"))
    }

    fn fees(&mut self, _pair: &str) -> Result<Decimal> {
        Ok(self.minfo.fees)
    }

    fn all_pairs(&mut self) -> Result<Vec<String>> {
        Ok(vec![self.pair.clone()])
    }

    fn reset(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn is_test(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm_core::FeeScheme;
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

    #[test]
    fn test_replay_walks_samples() {
        let mk = |p: Decimal, t: i64| Ticker::new(Price::new(p), Price::new(p), Price::new(p), t);
        let (mut src, handle) =
            ReplaySource::new("BTCUSD", minfo(), vec![mk(dec!(1), 0), mk(dec!(2), 1)]);

        assert_eq!(src.ticker("BTCUSD").unwrap().time_ms, 0);
        assert!(handle.step());
        assert_eq!(src.ticker("BTCUSD").unwrap().time_ms, 1);
        assert!(!handle.step());
        // The cursor stays on the final sample.
        assert_eq!(src.ticker("BTCUSD").unwrap().time_ms, 1);
    }
}
