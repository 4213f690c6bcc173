//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown trader: {0}")]
    UnknownTrader(String),

    #[error("unknown broker: {0}")]
    UnknownBroker(String),

    #[error("trader error: {0}")]
    Trader(#[from] pmm_trader::TraderError),

    #[error("exchange error: {0}")]
    Exchange(#[from] pmm_exchange::ExchangeError),

    #[error("storage error: {0}")]
    Storage(#[from] pmm_storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    /// CLI exit code for this error: 2 for unknown entities and
    /// config problems, 3 for runtime failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            BotError::Config(_) | BotError::UnknownTrader(_) | BotError::UnknownBroker(_) => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
