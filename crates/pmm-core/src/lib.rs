//! Core domain types for the pmm trading service.
//!
//! This crate provides the types shared by every other crate:
//! - `Price`, `Size`: precision-safe numeric newtypes
//! - `Ticker`, `Order`, `Trade`: the pair-trading vocabulary
//! - `MarketInfo`: per-pair trading rules and the fee model
//! - `Chart`: the bounded ring of recent ticker samples

pub mod chart;
pub mod decimal;
pub mod error;
pub mod market;
pub mod types;

pub use chart::Chart;
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use market::{FeeScheme, MarketInfo};
pub use types::{Order, Ticker, Trade};
