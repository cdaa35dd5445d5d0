//! Cluster error types.

use thiserror::Error;

use stratus_db::DbError;

/// Errors reported by cloud providers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0} is not supported by this provider")]
    Unsupported(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("cloud api error: {0}")]
    Api(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors applying a policy blueprint.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("invalid blueprint: {0}")]
    Blueprint(#[from] serde_json::Error),
}

pub type PolicyResult<T> = Result<T, PolicyError>;
