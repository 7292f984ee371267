//! Cluster error types.

use thiserror::Error;

/// Errors raised by the membership protocol and its transports.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The peer could not be reached (connect failure, drop, or partition).
    #[error("peer unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("peer replied with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("membership actor is not running")]
    ActorStopped,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("state store error: {0}")]
    State(#[from] canteen_state::StateError),
}

impl ClusterError {
    /// Whether the failure is a reachability problem (as opposed to a bug).
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ClusterError::NetworkUnreachable(_) | ClusterError::Timeout(_)
        )
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
