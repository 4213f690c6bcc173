//! Timed task scheduling for the pmm trading service.
//!
//! A [`Scheduler`] owns one timer thread and a small worker pool;
//! trading cycles, admin commands, and deferred stats all run as
//! plain closures on the workers. The [`ActionQueue`] layers a
//! 1-second serial drain on top for work that may accumulate.

pub mod queue;
pub mod scheduler;

pub use queue::ActionQueue;
pub use scheduler::{Handle, Scheduler, Worker};
