//! The trading-cycle engine of the pmm service.
//!
//! One [`Trader`] per configured pair. Each cycle reads the market,
//! reconciles exchange-side trades with its own expected trades,
//! updates the position model, asks the strategy for a new quote
//! pair, applies it with replace-or-place semantics, and commits the
//! journal in one atomic put.

pub mod backtest;
pub mod config;
pub mod spread;
pub mod stats;
pub mod strategy;
pub mod trader;

mod error;

pub use backtest::Backtest;
pub use config::TraderConfig;
pub use error::{Result, TraderError};
pub use spread::{SpreadCell, SpreadEstimator};
pub use stats::{CycleSummary, NullStats, StatsSink};
pub use strategy::{compute_quotes, QuotePair, QuoteTarget};
pub use trader::{Journal, RangeInfo, Trader};
