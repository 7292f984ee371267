//! Ledger error types.

use canteen_cluster::ClusterError;
use canteen_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger could not be reached or is temporarily refusing work.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger rejected request: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl LedgerError {
    /// Only availability failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        LedgerError::Unavailable(msg.into())
    }
}

impl From<ClusterError> for LedgerError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Status { status: 404, body } => LedgerError::NotFound(body),
            ClusterError::Status { status, body } if (400..500).contains(&status) => {
                LedgerError::Rejected(body)
            }
            ClusterError::Codec(msg) => LedgerError::Codec(msg),
            other => LedgerError::Unavailable(other.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
