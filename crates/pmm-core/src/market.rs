//! Per-pair trading rules and the fee model.

use crate::{Price, Size};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of the pair the exchange charges its fee in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeScheme {
    /// Fee is charged in the quote currency (the common case).
    #[default]
    Currency,
    /// Fee is deducted from the traded asset.
    Asset,
}

/// Trading rules for one pair, refreshed from the adapter each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    /// Symbol of the accumulated asset, e.g. `BTC`.
    pub asset_symbol: String,
    /// Symbol of the quote currency, e.g. `USD`.
    pub currency_symbol: String,
    /// Smallest order size the exchange accepts.
    pub min_size: Size,
    /// Size granularity.
    pub size_step: Size,
    /// Price granularity.
    pub price_step: Price,
    /// Fee as a fraction of notional, e.g. 0.001 for 10 bps.
    pub fees: Decimal,
    /// 0 for spot; > 0 enables linear margin accounting.
    pub leverage: Decimal,
    #[serde(default)]
    pub fee_scheme: FeeScheme,
}

impl MarketInfo {
    /// True when margin accounting applies.
    pub fn is_margin(&self) -> bool {
        self.leverage > Decimal::ZERO
    }

    /// Apply the fee to a fill, returning the effective size and price.
    ///
    /// Total for any input and preserves the sign of `size`: a
    /// currency-scheme buy pays an effectively higher price, a sell
    /// receives a lower one; an asset-scheme buy receives less asset.
    pub fn remove_fees(&self, size: Size, price: Price) -> (Size, Price) {
        if self.fees.is_zero() || size.is_zero() {
            return (size, price);
        }
        match self.fee_scheme {
            FeeScheme::Currency => {
                let adj = if size.is_buy() {
                    Decimal::ONE + self.fees
                } else {
                    Decimal::ONE - self.fees
                };
                (size, Price::new(price.inner() * adj))
            }
            FeeScheme::Asset => {
                let eff = if size.is_buy() {
                    size.inner() * (Decimal::ONE - self.fees)
                } else {
                    size.inner()
                };
                (Size::new(eff), price)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn info(fees: Decimal, scheme: FeeScheme) -> MarketInfo {
        MarketInfo {
            asset_symbol: "BTC".into(),
            currency_symbol: "USD".into(),
            min_size: Size::new(dec!(0.001)),
            size_step: Size::new(dec!(0.001)),
            price_step: Price::new(dec!(0.01)),
            fees,
            leverage: Decimal::ZERO,
            fee_scheme: scheme,
        }
    }

    #[test]
    fn test_currency_fee_moves_price_against_caller() {
        let mi = info(dec!(0.001), FeeScheme::Currency);

        let (es, ep) = mi.remove_fees(Size::new(dec!(1)), Price::new(dec!(100)));
        assert_eq!(es.inner(), dec!(1));
        assert_eq!(ep.inner(), dec!(100.1));

        let (es, ep) = mi.remove_fees(Size::new(dec!(-1)), Price::new(dec!(100)));
        assert_eq!(es.inner(), dec!(-1));
        assert_eq!(ep.inner(), dec!(99.9));
    }

    #[test]
    fn test_asset_fee_shrinks_bought_size() {
        let mi = info(dec!(0.002), FeeScheme::Asset);

        let (es, ep) = mi.remove_fees(Size::new(dec!(2)), Price::new(dec!(50)));
        assert_eq!(es.inner(), dec!(1.996));
        assert_eq!(ep.inner(), dec!(50));

        // Sells pay nothing in asset under this scheme.
        let (es, _) = mi.remove_fees(Size::new(dec!(-2)), Price::new(dec!(50)));
        assert_eq!(es.inner(), dec!(-2));
    }

    #[test]
    fn test_zero_fee_is_identity() {
        let mi = info(Decimal::ZERO, FeeScheme::Currency);
        let (es, ep) = mi.remove_fees(Size::new(dec!(-3)), Price::new(dec!(7)));
        assert_eq!(es.inner(), dec!(-3));
        assert_eq!(ep.inner(), dec!(7));
    }

    #[test]
    fn test_sign_preserved() {
        for scheme in [FeeScheme::Currency, FeeScheme::Asset] {
            let mi = info(dec!(0.01), scheme);
            let (es, _) = mi.remove_fees(Size::new(dec!(-1)), Price::new(dec!(10)));
            assert!(es.is_sell());
            let (es, _) = mi.remove_fees(Size::new(dec!(1)), Price::new(dec!(10)));
            assert!(es.is_buy());
        }
    }
}
