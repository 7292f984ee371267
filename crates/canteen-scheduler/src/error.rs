//! Scheduler error types.

use canteen_cluster::ClusterError;
use canteen_enforcer::EnforcerError;
use canteen_ledger::LedgerError;
use canteen_placement::PlacementError;
use canteen_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("enforcer error: {0}")]
    Enforcer(#[from] EnforcerError),

    /// No ALIVE node has published fresh telemetry yet.
    #[error("no fresh telemetry to schedule {0}")]
    NoTelemetry(String),

    #[error("evaluation task failed: {0}")]
    Evaluation(String),

    #[error("coordinator stopped")]
    ActorStopped,
}

impl SchedulerError {
    /// Whether the request should go back on the queue with backoff
    /// rather than be dropped by this node.
    pub fn is_requeueable(&self) -> bool {
        match self {
            SchedulerError::Placement(PlacementError::DecryptionUnavailable(_)) => true,
            SchedulerError::Ledger(e) => e.is_retryable(),
            SchedulerError::NoTelemetry(_) | SchedulerError::Evaluation(_) => true,
            _ => false,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_requeue() {
        let decrypt = SchedulerError::from(PlacementError::DecryptionUnavailable("offline".into()));
        assert!(decrypt.is_requeueable());
        assert!(SchedulerError::from(LedgerError::unavailable("down")).is_requeueable());
        assert!(SchedulerError::NoTelemetry("req-1".into()).is_requeueable());
    }

    #[test]
    fn permanent_failures_do_not() {
        assert!(!SchedulerError::from(LedgerError::Rejected("bad hash".into())).is_requeueable());
        let inconsistent =
            SchedulerError::from(PlacementError::InconsistentRelease("sum".into()));
        assert!(!inconsistent.is_requeueable());
    }
}
