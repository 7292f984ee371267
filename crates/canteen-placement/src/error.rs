//! Placement error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// The release step could not complete; the request should be retried later.
    #[error("decryption authority unavailable: {0}")]
    DecryptionUnavailable(String),

    #[error("released assignment is inconsistent: {0}")]
    InconsistentRelease(String),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
