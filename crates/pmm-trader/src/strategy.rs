//! Quote computation.
//!
//! Turns the current market, the position model, and the smoothed
//! spread into one buy and one sell target. Offsets are skewed by
//! inventory so a loaded trader quotes less aggressively on the side
//! that would grow its position.

use crate::config::TraderConfig;
use pmm_core::{MarketInfo, Price, Size};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One side of the target quote pair. The size is signed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuoteTarget {
    pub price: Price,
    pub size: Size,
}

/// The pair of targets a cycle wants resting. A `None` side means
/// no order should rest there (e.g. position limit reached).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuotePair {
    pub buy: Option<QuoteTarget>,
    pub sell: Option<QuoteTarget>,
}

/// Compute the target quote pair.
///
/// `spread` is the full spread fraction; each side sits half of it
/// away from `last`, shifted by the inventory skew. After step
/// rounding the buy always stays strictly below `last` and the sell
/// strictly above it. The internal balance is a model relative to
/// the journal start, so neither side is withheld unless a position
/// bound says so.
pub fn compute_quotes(
    minfo: &MarketInfo,
    last: Price,
    balance: Size,
    spread: f64,
    cfg: &TraderConfig,
) -> QuotePair {
    if !last.is_positive() {
        return QuotePair::default();
    }

    let half = Decimal::from_f64_retain(spread / 2.0)
        .unwrap_or(Decimal::ZERO)
        .max(Decimal::ZERO);

    let ratio = inventory_ratio(balance, cfg.max_position);
    let skew = cfg.spread_skew * ratio;
    let buy_off = (half * (Decimal::ONE + skew)).max(Decimal::ZERO);
    let sell_off = (half * (Decimal::ONE - skew)).max(Decimal::ZERO);

    let mut buy_price =
        Price::new(last.inner() * (Decimal::ONE - buy_off)).round_down(minfo.price_step);
    if buy_price >= last {
        buy_price = Price::new(last.inner() - minfo.price_step.inner()).round_down(minfo.price_step);
    }
    let mut sell_price =
        Price::new(last.inner() * (Decimal::ONE + sell_off)).round_up(minfo.price_step);
    if sell_price <= last {
        sell_price = Price::new(last.inner() + minfo.price_step.inner()).round_up(minfo.price_step);
    }

    let buy_magnitude = match cfg.max_position {
        Some(cap) => cfg.order_size.min((cap - balance.inner()).max(Decimal::ZERO)),
        None => cfg.order_size,
    };
    let sell_magnitude = match cfg.min_position {
        Some(floor) => cfg.order_size.min((balance.inner() - floor).max(Decimal::ZERO)),
        None => cfg.order_size,
    };

    let buy = side_size(buy_magnitude, minfo).map(|size| QuoteTarget {
        price: buy_price,
        size,
    });
    let sell = side_size(sell_magnitude, minfo).map(|size| QuoteTarget {
        price: sell_price,
        size: -size,
    });

    QuotePair { buy, sell }
}

fn inventory_ratio(balance: Size, max_position: Option<Decimal>) -> Decimal {
    match max_position {
        Some(cap) if cap > Decimal::ZERO => (balance.inner() / cap)
            .max(Decimal::NEGATIVE_ONE)
            .min(Decimal::ONE),
        _ => Decimal::ZERO,
    }
}

/// Clamp a positive magnitude to the exchange steps; below the
/// minimum there is no order.
fn side_size(magnitude: Decimal, minfo: &MarketInfo) -> Option<Size> {
    let size = Size::new(magnitude).round_to_step(minfo.size_step);
    if size.inner() < minfo.min_size.inner() || size.is_zero() {
        None
    } else {
        Some(size)
    }
}
