//! Error types for the cycle engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraderError {
    #[error("exchange error: {0}")]
    Exchange(#[from] pmm_exchange::ExchangeError),

    #[error("storage error: {0}")]
    Storage(#[from] pmm_storage::StorageError),

    /// Replace lost its race twice in one cycle; retry next tick.
    #[error("order replace rejected twice, cycle aborted")]
    ReplaceRace,

    /// Malformed market info or similar structural fault.
    #[error("structural fault: {0}")]
    Structural(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TraderError {
    /// Transient faults are retried next tick without escalation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TraderError::Exchange(pmm_exchange::ExchangeError::Transient(_))
                | TraderError::Exchange(pmm_exchange::ExchangeError::Io(_))
                | TraderError::ReplaceRace
                | TraderError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TraderError>;
