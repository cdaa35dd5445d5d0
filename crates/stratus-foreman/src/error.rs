//! Error types for minion RPC.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for foreman operations.
pub type ForemanResult<T> = Result<T, ForemanError>;

#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("invalid minion address {0}")]
    InvalidAddress(String),

    #[error("connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("minion rpc timed out after {0:?}")]
    Timeout(Duration),

    #[error("minion rpc failed: {0}")]
    Rpc(String),

    #[error("minion responded with status {0}")]
    Status(u16),

    #[error("client closed")]
    Closed,

    #[error("minion config codec: {0}")]
    Codec(#[from] serde_json::Error),
}
