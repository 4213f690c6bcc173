//! Versioned atomic key-value persistence for pmm.
//!
//! One key per trader (the journal) plus one for the rendered
//! report. Every put is a whole-value atomic replace; a bounded
//! chain of older revisions is kept for recovery.

pub mod error;
pub mod store;

pub use error::{Result, StorageError};
pub use store::{Format, Storage, StorageFactory};
