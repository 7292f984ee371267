//! Enforcer error types.

use canteen_state::{ContainerState, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnforcerError {
    /// A container runtime operation failed.
    #[error("runtime failure: {0}")]
    Runtime(String),

    #[error("runtime call timed out: {0}")]
    Timeout(String),

    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: ContainerState,
        to: ContainerState,
    },

    /// Some replicas of an assignment could not be launched; they were
    /// recorded FAILED and signalled for reschedule.
    #[error("{failed} of {requested} replicas of {request_id} failed to launch: {error}")]
    PartialApply {
        request_id: String,
        failed: usize,
        requested: u32,
        error: String,
    },

    #[error("no free host port in {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("enforcer is not running")]
    ActorStopped,

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type EnforcerResult<T> = Result<T, EnforcerError>;
