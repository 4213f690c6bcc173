//! Per-trader configuration.
//!
//! One `[trader.<id>]` table per trader in the service config; the
//! backtest command additionally overlays `key=value` overrides.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TraderError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    /// Broker name resolved through the stock selector.
    pub broker: String,
    /// Pair identity, opaque to the engine (e.g. `BTCUSD`).
    pub pair: String,
    /// Display title for the report; defaults to the trader id.
    #[serde(default)]
    pub title: String,

    /// Size of each placed order, in asset units.
    pub order_size: Decimal,
    /// Largest position the buy side will build up to. Unset means
    /// unbounded, and also disables the inventory skew.
    #[serde(default)]
    pub max_position: Option<Decimal>,
    /// Smallest position the sell side may reduce to. Unset means
    /// unbounded; the internal balance is a model relative to the
    /// journal start, so it may go negative.
    #[serde(default)]
    pub min_position: Option<Decimal>,
    /// Inventory skew factor applied to the half-spread offsets.
    #[serde(default = "default_skew")]
    pub spread_skew: Decimal,

    /// Quote currency the emulator starts with in dry-run mode.
    #[serde(default = "default_initial_currency")]
    pub initial_currency: Decimal,
    /// Force the emulator wrap even on a live broker.
    #[serde(default)]
    pub dry_run: bool,

    /// Chart ring capacity.
    #[serde(default = "default_chart_capacity")]
    pub chart_capacity: usize,
    /// Recompute the smoothed spread every this many cycles. Zero
    /// inherits the service-wide default at load time.
    #[serde(default)]
    pub spread_calc_interval: u64,
    /// Log-return window the spread estimator works over.
    #[serde(default = "default_spread_window")]
    pub spread_window: usize,
    /// EMA smoothing factor for the spread estimate.
    #[serde(default = "default_spread_alpha")]
    pub spread_alpha: f64,
    /// Extra floor on the spread fraction, on top of round-trip fees.
    #[serde(default)]
    pub min_spread: f64,
}

fn default_skew() -> Decimal {
    Decimal::new(3, 1) // 0.3
}

fn default_initial_currency() -> Decimal {
    Decimal::from(1000)
}

fn default_chart_capacity() -> usize {
    pmm_core::chart::DEFAULT_CAPACITY
}

fn default_spread_window() -> usize {
    120
}

fn default_spread_alpha() -> f64 {
    0.15
}

impl TraderConfig {
    /// Overlay `key=value` pairs, as given on the backtest command
    /// line. Values parse as JSON scalars where possible and fall
    /// back to strings, so `order_size=0.02 dry_run=true` works.
    pub fn apply_overrides<'a>(
        &self,
        overrides: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<TraderConfig> {
        let mut doc = serde_json::to_value(self)
            .map_err(|e| TraderError::Config(e.to_string()))?;
        let map = doc
            .as_object_mut()
            .ok_or_else(|| TraderError::Config("config is not a table".into()))?;
        for (key, raw) in overrides {
            let key = key.trim();
            let raw = raw.trim();
            if key.is_empty() {
                return Err(TraderError::Config("empty override key".into()));
            }
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
            map.insert(key.to_string(), value);
        }
        serde_json::from_value(doc)
            .map_err(|e| TraderError::Config(format!("bad override: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base() -> TraderConfig {
        serde_json::from_value(serde_json::json!({
            "broker": "emu",
            "pair": "BTCUSD",
            "order_size": "0.01",
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_fill_in() {
        let cfg = base();
        assert_eq!(cfg.spread_calc_interval, 0);
        assert_eq!(cfg.spread_skew, dec!(0.3));
        assert_eq!(cfg.initial_currency, dec!(1000));
        assert!(!cfg.dry_run);
    }

    #[test]
    fn test_overrides_replace_values() {
        let cfg = base()
            .apply_overrides([("order_size", "0.05"), ("dry_run", "true"), ("title", "bt")])
            .unwrap();
        assert_eq!(cfg.order_size, dec!(0.05));
        assert!(cfg.dry_run);
        assert_eq!(cfg.title, "bt");
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let err = base().apply_overrides([("order_size", "not-a-number")]);
        assert!(matches!(err, Err(TraderError::Config(_))));
    }
}
