//! Error types for the Stratus database.

use thiserror::Error;

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Recoverable errors surfaced by database reads.
///
/// Invariant violations (type confusion on commit, more than one row in a
/// singleton table, access to a table outside the transaction scope) are
/// programming errors and panic instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("no {0} row found")]
    NotFound(&'static str),

    #[error("invalid role: {0}")]
    InvalidRole(String),

    #[error("invalid provider: {0}")]
    InvalidProvider(String),
}

/// Errors returned by prefix-based identifier lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("no match for {0}")]
    NotFound(String),

    #[error("ambiguous identifiers {0} and {1}")]
    Ambiguous(String, String),
}
