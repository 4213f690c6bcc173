//! Exchange adapter surface for the pmm trading service.
//!
//! Three implementations of the [`StockApi`] trait live here:
//! - [`ProcBroker`]: shim over an external adapter subprocess
//! - [`Emulator`]: virtual exchange wrapping any source adapter
//! - [`ReplaySource`]: historical chart feed for backtests
//!
//! plus the [`StockSelector`] registry that maps broker names to
//! running adapters.

pub mod api;
pub mod emulator;
pub mod proc;
pub mod replay;
pub mod selector;

pub use api::{ExchangeError, Result, SharedStock, SharedStockApi, StockApi};
pub use emulator::Emulator;
pub use proc::ProcBroker;
pub use replay::{ReplayHandle, ReplaySource};
pub use selector::StockSelector;
