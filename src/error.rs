use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Lock acquisition timed out on {path:?} after {waited_ms}ms")]
    LockTimeout { path: String, waited_ms: u64 },

    #[error("Lock on {path:?} was lost: lease expired and record reclaimed")]
    LockLost { path: String },

    #[error("Value at {path:?} is not a number")]
    NotANumber { path: String },

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
