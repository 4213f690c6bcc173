//! Pair-trading vocabulary: tickers, orders, trades.

use crate::{Price, Size};
use serde::{Deserialize, Serialize};

/// A market snapshot as reported by an adapter.
///
/// `bid <= last <= ask` normally holds, but the engine tolerates
/// violations and only relies on `last`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Price,
    pub ask: Price,
    pub last: Price,
    pub time_ms: i64,
}

impl Ticker {
    pub fn new(bid: Price, ask: Price, last: Price, time_ms: i64) -> Self {
        Self {
            bid,
            ask,
            last,
            time_ms,
        }
    }
}

/// A resting limit order. Positive size buys, negative size sells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-assigned id.
    pub id: u64,
    /// Caller-assigned tag, used to recognize the engine's own orders.
    pub client_id: Option<String>,
    pub size: Size,
    pub price: Price,
}

impl Order {
    pub fn new(id: u64, client_id: Option<String>, size: Size, price: Price) -> Self {
        Self {
            id,
            client_id,
            size,
            price,
        }
    }
}

/// An exchange-reported fill.
///
/// `eff_size`/`eff_price` are the post-fee quantities; the sign of
/// `eff_size` always matches the sign of `size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub time_ms: i64,
    pub size: Size,
    pub price: Price,
    pub eff_size: Size,
    pub eff_price: Price,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_roundtrips_through_json() {
        let trade = Trade {
            id: 42,
            time_ms: 1_700_000_000_000,
            size: Size::new(dec!(0.5)),
            price: Price::new(dec!(101.25)),
            eff_size: Size::new(dec!(0.5)),
            eff_price: Price::new(dec!(101.35)),
        };
        let json = serde_json::to_string(&trade).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trade);
    }

    #[test]
    fn test_order_sides() {
        let buy = Order::new(1, Some("buy".into()), Size::new(dec!(1)), Price::new(dec!(99)));
        let sell = Order::new(2, Some("sell".into()), Size::new(dec!(-1)), Price::new(dec!(101)));
        assert!(buy.size.is_buy());
        assert!(sell.size.is_sell());
    }
}
