//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Failures from the embedded redb store. Every variant carries the
/// underlying error rendered as text.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    /// A read or write against an open table failed.
    #[error("state storage error: {0}")]
    Storage(String),

    /// A stored record could not be encoded or decoded as JSON.
    #[error("state record codec error: {0}")]
    Codec(String),
}
