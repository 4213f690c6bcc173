//! Aggregate state reporting for the pmm trading service.
//!
//! Traders push per-cycle summaries through the [`QueuedStats`]
//! sink; the shared [`Report`] renders them to `report.json` and the
//! optional HTTP server exposes the report directory.

pub mod report;
pub mod server;

pub use report::{QueuedStats, Report};
pub use server::{parse_bind, spawn_server, ServerHandle};
