//! Crate-wide error type and result alias

use thiserror::Error;

/// Errors produced by the session gateway
#[derive(Debug, Error)]
pub enum LecternError {
    /// Backing store operation failed
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration problem detected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// WebSocket transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Client supplied something malformed
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Valkey error: {0}")]
    Valkey(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, LecternError>;
