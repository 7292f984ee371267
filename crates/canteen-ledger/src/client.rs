//! The ledger contract and the store-backed development ledger.
//!
//! [`LedgerClient`] is everything a node needs from the external registry:
//! node registration, image submissions and scaling, first-wins anchoring of
//! commitment hashes, the cluster policy blob, and an ordered event log to
//! poll.
//!
//! [`StoreLedger`] implements the contract over a [`StateStore`]. It backs
//! the `canteend ledger` development server and the in-process tests, and it
//! can be switched unavailable to exercise retry and degraded paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use canteen_placement::commitment::{outcome_commitment, status_commitment};
use canteen_state::{
    AnchorCommitment, AnchorSubject, Ciphertext, DeploymentRequest, ImageSpec, LedgerEvent,
    LedgerEventKind, RegisteredNode, RequestOrigin, StateStore, epoch_millis,
};
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};

#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    async fn register_node(&self, node_id: &str, encrypted_capacity: Ciphertext)
    -> LedgerResult<()>;

    async fn deregister_node(&self, node_id: &str) -> LedgerResult<()>;

    async fn members(&self) -> LedgerResult<Vec<RegisteredNode>>;

    /// Submit an image; the ledger assigns the request id. A submission
    /// replacing a failed replica is accepted once per replica; repeating it
    /// returns the request recorded the first time.
    async fn add_image(&self, spec: ImageSpec) -> LedgerResult<DeploymentRequest>;

    async fn remove_image(&self, name: &str) -> LedgerResult<()>;

    /// Set the total replica count of a deployed image.
    async fn scale_image(&self, name: &str, replicas: u32) -> LedgerResult<()>;

    /// Record a commitment. Returns `true` when newly recorded, `false` when
    /// the subject was already anchored (the earlier anchor stands).
    async fn anchor_deployment(&self, commitment: AnchorCommitment) -> LedgerResult<bool>;

    /// The anchor recorded for a request, if any.
    async fn anchored(&self, request_id: &str) -> LedgerResult<Option<AnchorCommitment>>;

    async fn cluster_policy(&self) -> LedgerResult<Vec<u8>>;

    /// Events with `seq > after`, oldest first.
    async fn events_since(&self, after: u64, limit: usize) -> LedgerResult<Vec<LedgerEvent>>;
}

/// Key an anchor is deduplicated under.
///
/// Outcomes are first-wins per request id; status digests are keyed by their
/// own hash, so re-anchoring an identical digest is a no-op.
pub fn anchor_key(commitment: &AnchorCommitment) -> String {
    match &commitment.subject {
        AnchorSubject::Outcome(outcome) => format!("request:{}", outcome.request_id()),
        AnchorSubject::Status { .. } => format!("status:{}", commitment.hash),
    }
}

fn request_key(request_id: &str) -> String {
    format!("request:{request_id}")
}

// ── Store-backed ledger ───────────────────────────────────────────

#[derive(Clone)]
pub struct StoreLedger {
    store: StateStore,
    available: Arc<AtomicBool>,
}

impl StoreLedger {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Fault injection: while unavailable every call fails with
    /// [`LedgerError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_policy(&self, policy: &[u8]) -> LedgerResult<()> {
        self.store.set_policy_bytes(policy)?;
        Ok(())
    }

    fn check(&self) -> LedgerResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::Unavailable("ledger offline".into()))
        }
    }
}

#[async_trait]
impl LedgerClient for StoreLedger {
    async fn register_node(
        &self,
        node_id: &str,
        encrypted_capacity: Ciphertext,
    ) -> LedgerResult<()> {
        self.check()?;
        self.store.put_registered_node(&RegisteredNode {
            node_id: node_id.to_string(),
            encrypted_capacity,
            registered_at: epoch_millis(),
        })?;
        info!(%node_id, "node registered");
        Ok(())
    }

    async fn deregister_node(&self, node_id: &str) -> LedgerResult<()> {
        self.check()?;
        if self.store.remove_registered_node(node_id)? {
            info!(%node_id, "node deregistered");
        }
        Ok(())
    }

    async fn members(&self) -> LedgerResult<Vec<RegisteredNode>> {
        self.check()?;
        Ok(self.store.list_registered_nodes()?)
    }

    async fn add_image(&self, spec: ImageSpec) -> LedgerResult<DeploymentRequest> {
        self.check()?;
        if spec.name.trim().is_empty() {
            return Err(LedgerError::Rejected("image name is empty".into()));
        }
        let build = |seq: u64, origin: RequestOrigin| DeploymentRequest {
            id: format!("req-{seq:08}"),
            image: spec.name.clone(),
            replicas: spec.replicas,
            constraints: spec.constraints.clone(),
            origin,
            created_at: epoch_millis(),
        };
        let request = match &spec.reschedule_of {
            Some(slot) => {
                let origin = RequestOrigin::Reschedule {
                    replaces: slot.clone(),
                };
                let (request, fresh) = self
                    .store
                    .append_replacement_request(slot, |seq| build(seq, origin))?;
                if !fresh {
                    debug!(%slot, request_id = %request.id, "replacement already submitted");
                    return Ok(request);
                }
                request
            }
            None => {
                let event = self.store.append_ledger_event_with(|seq| {
                    LedgerEventKind::ImageAdded {
                        request: build(seq, RequestOrigin::Operator),
                    }
                })?;
                match event.kind {
                    LedgerEventKind::ImageAdded { request } => request,
                    other => return Err(LedgerError::Codec(format!("unexpected event {other:?}"))),
                }
            }
        };
        info!(request_id = %request.id, image = %request.image, replicas = request.replicas, "image added");
        Ok(request)
    }

    async fn remove_image(&self, name: &str) -> LedgerResult<()> {
        self.check()?;
        self.store.append_ledger_event(LedgerEventKind::ImageRemoved {
            image: name.to_string(),
        })?;
        info!(image = %name, "image removed");
        Ok(())
    }

    async fn scale_image(&self, name: &str, replicas: u32) -> LedgerResult<()> {
        self.check()?;
        if name.trim().is_empty() {
            return Err(LedgerError::Rejected("image name is empty".into()));
        }
        self.store.append_ledger_event(LedgerEventKind::ImageScaled {
            image: name.to_string(),
            replicas,
        })?;
        info!(image = %name, replicas, "image scaled");
        Ok(())
    }

    async fn anchor_deployment(&self, commitment: AnchorCommitment) -> LedgerResult<bool> {
        self.check()?;
        let (expected, event) = match &commitment.subject {
            AnchorSubject::Outcome(outcome) => (
                outcome_commitment(outcome),
                LedgerEventKind::ImageDeployment {
                    request_id: outcome.request_id().to_string(),
                    commitment: commitment.hash.clone(),
                    outcome: outcome.clone(),
                },
            ),
            AnchorSubject::Status {
                node_id,
                containers,
            } => (
                status_commitment(node_id, containers),
                LedgerEventKind::StatusAnchored {
                    node_id: node_id.clone(),
                    commitment: commitment.hash.clone(),
                },
            ),
        };
        if expected != commitment.hash {
            return Err(LedgerError::Rejected(format!(
                "commitment {} does not match its subject",
                commitment.hash
            )));
        }

        let key = anchor_key(&commitment);
        let recorded = self
            .store
            .anchor_if_absent(&key, &commitment, event)?
            .is_some();
        debug!(%key, hash = %commitment.hash, recorded, "anchor submitted");
        Ok(recorded)
    }

    async fn anchored(&self, request_id: &str) -> LedgerResult<Option<AnchorCommitment>> {
        self.check()?;
        Ok(self.store.get_anchor(&request_key(request_id))?)
    }

    async fn cluster_policy(&self) -> LedgerResult<Vec<u8>> {
        self.check()?;
        Ok(self.store.policy_bytes()?)
    }

    async fn events_since(&self, after: u64, limit: usize) -> LedgerResult<Vec<LedgerEvent>> {
        self.check()?;
        Ok(self.store.ledger_events_since(after, limit)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use canteen_placement::commitment::{anchor_for_outcome, anchor_for_status, assignment_commitment};
    use canteen_state::{
        AssignmentOutcome, CommitmentHash, ContainerState, DeploymentAssignment,
        PlacementConstraints, ReplicaSlot,
    };

    fn ledger() -> StoreLedger {
        StoreLedger::new(StateStore::open_in_memory().unwrap())
    }

    fn spec(name: &str, replicas: u32) -> ImageSpec {
        ImageSpec {
            name: name.into(),
            replicas,
            constraints: PlacementConstraints::default(),
            reschedule_of: None,
        }
    }

    fn assigned(request_id: &str, node: &str) -> AssignmentOutcome {
        let placements: BTreeMap<String, u32> = [(node.to_string(), 1)].into_iter().collect();
        AssignmentOutcome::Assigned(DeploymentAssignment {
            request_id: request_id.into(),
            image: "nginx".into(),
            commitment: assignment_commitment(request_id, "nginx", &placements),
            placements,
        })
    }

    #[tokio::test]
    async fn add_image_assigns_sequential_request_ids() {
        let ledger = ledger();
        let first = ledger.add_image(spec("nginx", 2)).await.unwrap();
        let second = ledger.add_image(spec("redis", 1)).await.unwrap();
        assert_eq!(first.id, "req-00000001");
        assert_eq!(second.id, "req-00000002");
        assert_eq!(first.origin, RequestOrigin::Operator);

        let events = ledger.events_since(0, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0].kind, LedgerEventKind::ImageAdded { request } if request.image == "nginx"));
    }

    #[tokio::test]
    async fn reschedule_origin_is_recorded_once() {
        let ledger = ledger();
        let slot = ReplicaSlot {
            request_id: "req-00000001".into(),
            node_id: "node-a".into(),
            index: 0,
        };
        let mut s = spec("nginx", 1);
        s.reschedule_of = Some(slot.clone());
        let req = ledger.add_image(s.clone()).await.unwrap();
        assert_eq!(
            req.origin,
            RequestOrigin::Reschedule {
                replaces: slot.clone()
            }
        );

        // A resubmission of the same replacement returns the first request.
        let again = ledger.add_image(s).await.unwrap();
        assert_eq!(again, req);
        assert_eq!(ledger.events_since(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scale_appends_an_event() {
        let ledger = ledger();
        ledger.add_image(spec("nginx", 3)).await.unwrap();
        ledger.scale_image("nginx", 1).await.unwrap();
        let events = ledger.events_since(1, 10).await.unwrap();
        assert_eq!(
            events[0].kind,
            LedgerEventKind::ImageScaled {
                image: "nginx".into(),
                replicas: 1
            }
        );
        assert!(matches!(
            ledger.scale_image(" ", 1).await,
            Err(LedgerError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn empty_image_name_is_rejected() {
        let err = ledger().add_image(spec("  ", 1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[tokio::test]
    async fn anchoring_is_first_wins_per_request() {
        let ledger = ledger();
        let first = anchor_for_outcome(&assigned("req-1", "node-a"));
        let second = anchor_for_outcome(&assigned("req-1", "node-b"));

        assert!(ledger.anchor_deployment(first.clone()).await.unwrap());
        assert!(!ledger.anchor_deployment(first.clone()).await.unwrap());
        assert!(!ledger.anchor_deployment(second).await.unwrap());

        let stored = ledger.anchored("req-1").await.unwrap().unwrap();
        assert_eq!(stored.hash, first.hash);
        let events = ledger.events_since(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn mismatched_commitment_is_rejected() {
        let ledger = ledger();
        let mut anchor = anchor_for_outcome(&assigned("req-1", "node-a"));
        anchor.hash = CommitmentHash("00".repeat(32));
        let err = ledger.anchor_deployment(anchor).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
        assert!(ledger.anchored("req-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_anchors_dedupe_by_hash() {
        let ledger = ledger();
        let mut containers = BTreeMap::new();
        containers.insert("nginx:0".to_string(), ContainerState::Healthy);
        let anchor = anchor_for_status("node-a", containers.clone());
        assert!(ledger.anchor_deployment(anchor.clone()).await.unwrap());
        assert!(!ledger.anchor_deployment(anchor).await.unwrap());

        containers.insert("nginx:0".to_string(), ContainerState::Failed);
        assert!(ledger.anchor_deployment(anchor_for_status("node-a", containers)).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_ledger_fails_every_call() {
        let ledger = ledger();
        ledger.set_available(false);
        assert!(ledger.add_image(spec("nginx", 1)).await.unwrap_err().is_retryable());
        assert!(ledger.events_since(0, 1).await.unwrap_err().is_retryable());
        ledger.set_available(true);
        assert!(ledger.events_since(0, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn registration_round_trip() {
        let ledger = ledger();
        ledger.register_node("node-a", Ciphertext(vec![1])).await.unwrap();
        ledger.register_node("node-b", Ciphertext(vec![2])).await.unwrap();
        ledger.deregister_node("node-a").await.unwrap();
        let members = ledger.members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].node_id, "node-b");
    }
}
