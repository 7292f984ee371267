//! Container lifecycle rules.
//!
//! ```text
//! REQUESTED ─► PULLING ─► RUNNING ◄─► HEALTHY
//!                 │          │           │
//!                 └─► FAILED ◄┴───────────┘
//! any non-STOPPED ─► STOPPED (terminal)
//! ```
//!
//! HEALTHY returns to RUNNING after an in-place restart.

use canteen_state::{ContainerRecord, ContainerState, epoch_millis};

use crate::error::{EnforcerError, EnforcerResult};

pub fn can_transition(from: ContainerState, to: ContainerState) -> bool {
    use ContainerState::*;
    match (from, to) {
        (Stopped, _) => false,
        (_, Stopped) => true,
        (Requested, Pulling) => true,
        (Pulling, Running | Failed) => true,
        (Running, Healthy | Failed) => true,
        (Healthy, Running | Failed) => true,
        _ => false,
    }
}

/// Move `record` to `to`, rejecting transitions the lifecycle forbids.
/// Re-entering the current state is a no-op so reports stay idempotent.
pub fn advance(record: &mut ContainerRecord, to: ContainerState) -> EnforcerResult<bool> {
    if record.state == to {
        return Ok(false);
    }
    if !can_transition(record.state, to) {
        return Err(EnforcerError::InvalidTransition {
            from: record.state,
            to,
        });
    }
    record.state = to;
    record.updated_at = epoch_millis();
    Ok(true)
}
