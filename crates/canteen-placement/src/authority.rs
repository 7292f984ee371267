//! Release of encrypted assignments.
//!
//! A [`DecryptionAuthority`] is the only component that turns an
//! [`EncryptedAssignment`] into plaintext. It may be remote or slow, so
//! callers bound it with a timeout and treat failure as retryable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use canteen_state::{AssignmentOutcome, DeploymentAssignment, NodeId};
use tracing::{debug, warn};

use crate::commitment::assignment_commitment;
use crate::error::{PlacementError, PlacementResult};
use crate::fhe::SchedulingKey;
use crate::packing::EncryptedAssignment;

/// Plaintext form of an [`EncryptedAssignment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedAssignment {
    pub request_id: String,
    pub image: String,
    pub replicas: u32,
    pub placements: BTreeMap<NodeId, u32>,
    pub satisfiable: bool,
}

#[async_trait]
pub trait DecryptionAuthority: Send + Sync {
    async fn release(&self, assignment: &EncryptedAssignment)
    -> PlacementResult<ReleasedAssignment>;
}

/// Authority holding the scheduling key in-process.
///
/// Can be switched offline to exercise the retry path.
#[derive(Clone)]
pub struct KeyAuthority {
    key: SchedulingKey,
    online: Arc<AtomicBool>,
}

impl KeyAuthority {
    pub fn new(key: SchedulingKey) -> Self {
        Self {
            key,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl DecryptionAuthority for KeyAuthority {
    async fn release(
        &self,
        assignment: &EncryptedAssignment,
    ) -> PlacementResult<ReleasedAssignment> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(PlacementError::DecryptionUnavailable(
                "authority offline".into(),
            ));
        }
        let mut placements = BTreeMap::new();
        for (node, ct) in &assignment.per_node {
            let count = self.key.open(ct)?;
            let count = u32::try_from(count).map_err(|_| {
                PlacementError::InconsistentRelease(format!("{node}: count {count} out of range"))
            })?;
            placements.insert(node.clone(), count);
        }
        let satisfiable = self.key.open(&assignment.satisfiable)? == 1;
        debug!(
            request_id = %assignment.request_id,
            satisfiable,
            "released encrypted assignment"
        );
        Ok(ReleasedAssignment {
            request_id: assignment.request_id.clone(),
            image: assignment.image.clone(),
            replicas: assignment.replicas,
            placements,
            satisfiable,
        })
    }
}

/// Turn a released assignment into the outcome that gets anchored.
///
/// Zero-count nodes are dropped; a satisfiable release whose counts do not
/// add up to the requested replicas is rejected.
pub fn finalize(released: ReleasedAssignment) -> PlacementResult<AssignmentOutcome> {
    if !released.satisfiable {
        return Ok(AssignmentOutcome::Unsatisfiable {
            reason: format!(
                "insufficient eligible capacity for {} replicas",
                released.replicas
            ),
            request_id: released.request_id,
            image: released.image,
        });
    }

    let placements: BTreeMap<NodeId, u32> = released
        .placements
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .collect();
    let total: u64 = placements.values().map(|c| u64::from(*c)).sum();
    if total != u64::from(released.replicas) {
        warn!(
            request_id = %released.request_id,
            total,
            replicas = released.replicas,
            "released placement does not match replica count"
        );
        return Err(PlacementError::InconsistentRelease(format!(
            "placed {total} of {} replicas",
            released.replicas
        )));
    }

    let commitment = assignment_commitment(&released.request_id, &released.image, &placements);
    Ok(AssignmentOutcome::Assigned(DeploymentAssignment {
        request_id: released.request_id,
        image: released.image,
        placements,
        commitment,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::verify_commitment;
    use crate::fhe::{FheBackend, SimulatedFhe};
    use crate::packing::evaluate_schedule;
    use canteen_state::{
        DeploymentRequest, PlacementConstraints, RequestOrigin, TelemetryRecord,
    };

    fn setup() -> (SimulatedFhe, KeyAuthority) {
        let key = SchedulingKey::from_passphrase("authority");
        (SimulatedFhe::new(key.clone()), KeyAuthority::new(key))
    }

    fn inputs(fhe: &SimulatedFhe, caps: &[(&str, u64)]) -> Vec<TelemetryRecord> {
        caps.iter()
            .map(|(node, cap)| TelemetryRecord {
                node_id: node.to_string(),
                capacity: fhe.encrypt(*cap),
                load: fhe.encrypt(0),
                priority: fhe.encrypt(0),
                timestamp: 0,
                freshness_ms: u64::MAX,
            })
            .collect()
    }

    fn request(replicas: u32) -> DeploymentRequest {
        DeploymentRequest {
            id: "req-00000009".into(),
            image: "redis".into(),
            replicas,
            constraints: PlacementConstraints::default(),
            origin: RequestOrigin::Operator,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn release_then_finalize_assigns() {
        let (fhe, authority) = setup();
        let req = request(3);
        let ea = evaluate_schedule(
            &fhe,
            &req,
            &req.constraints,
            &inputs(&fhe, &[("node-2", 2), ("node-4", 4), ("node-6", 6)]),
        )
        .unwrap();

        let outcome = finalize(authority.release(&ea).await.unwrap()).unwrap();
        let assignment = outcome.assignment().unwrap();
        assert_eq!(assignment.total_replicas(), 3);
        assert_eq!(assignment.replicas_for("node-6"), 2);
        assert_eq!(assignment.replicas_for("node-4"), 1);
        assert!(!assignment.placements.contains_key("node-2"));
        assert!(verify_commitment(assignment));
    }

    #[tokio::test]
    async fn over_capacity_finalizes_unsatisfiable() {
        let (fhe, authority) = setup();
        let req = request(5);
        let ea = evaluate_schedule(
            &fhe,
            &req,
            &req.constraints,
            &inputs(&fhe, &[("a", 2), ("b", 2)]),
        )
        .unwrap();
        let outcome = finalize(authority.release(&ea).await.unwrap()).unwrap();
        assert!(matches!(outcome, AssignmentOutcome::Unsatisfiable { .. }));
        assert_eq!(outcome.request_id(), "req-00000009");
    }

    #[tokio::test]
    async fn offline_authority_is_unavailable() {
        let (fhe, authority) = setup();
        let req = request(1);
        let ea =
            evaluate_schedule(&fhe, &req, &req.constraints, &inputs(&fhe, &[("a", 1)])).unwrap();
        authority.set_online(false);
        let err = authority.release(&ea).await.unwrap_err();
        assert!(matches!(err, PlacementError::DecryptionUnavailable(_)));
        authority.set_online(true);
        assert!(authority.release(&ea).await.is_ok());
    }

    #[test]
    fn inconsistent_release_is_rejected() {
        let released = ReleasedAssignment {
            request_id: "r".into(),
            image: "i".into(),
            replicas: 3,
            placements: [("a".to_string(), 1)].into_iter().collect(),
            satisfiable: true,
        };
        assert!(matches!(
            finalize(released),
            Err(PlacementError::InconsistentRelease(_))
        ));
    }
}
