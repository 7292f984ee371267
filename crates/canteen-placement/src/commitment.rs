//! Commitment hashes anchored on the ledger.
//!
//! A commitment binds a request id to the exact plaintext outcome, so any
//! node holding the outcome can recompute and compare before acting on it.

use std::collections::BTreeMap;

use canteen_state::{
    AnchorCommitment, AnchorSubject, AssignmentOutcome, CommitmentHash, ContainerState,
    DeploymentAssignment, NodeId,
};
use sha2::{Digest, Sha256};

fn finish(hasher: Sha256) -> CommitmentHash {
    CommitmentHash(hex::encode(hasher.finalize()))
}

/// Length-prefixed field, so no choice of ids can shift bytes between
/// neighbouring fields.
fn field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Commitment over a satisfiable placement. Placements are hashed in node-id
/// order; zero-replica entries must already be dropped.
pub fn assignment_commitment(
    request_id: &str,
    image: &str,
    placements: &BTreeMap<NodeId, u32>,
) -> CommitmentHash {
    let mut hasher = Sha256::new();
    hasher.update(b"canteen/assignment/v2");
    field(&mut hasher, request_id.as_bytes());
    field(&mut hasher, image.as_bytes());
    hasher.update((placements.len() as u64).to_be_bytes());
    for (node, count) in placements {
        field(&mut hasher, node.as_bytes());
        hasher.update(count.to_be_bytes());
    }
    finish(hasher)
}

pub fn unsatisfiable_commitment(request_id: &str, image: &str, reason: &str) -> CommitmentHash {
    let mut hasher = Sha256::new();
    hasher.update(b"canteen/unsatisfiable/v2");
    field(&mut hasher, request_id.as_bytes());
    field(&mut hasher, image.as_bytes());
    field(&mut hasher, reason.as_bytes());
    finish(hasher)
}

/// Digest of one node's container states, for periodic status anchoring.
pub fn status_commitment(
    node_id: &str,
    containers: &BTreeMap<String, ContainerState>,
) -> CommitmentHash {
    let mut hasher = Sha256::new();
    hasher.update(b"canteen/status/v2");
    field(&mut hasher, node_id.as_bytes());
    hasher.update((containers.len() as u64).to_be_bytes());
    for (key, state) in containers {
        field(&mut hasher, key.as_bytes());
        field(&mut hasher, state.to_string().as_bytes());
    }
    finish(hasher)
}

pub fn outcome_commitment(outcome: &AssignmentOutcome) -> CommitmentHash {
    match outcome {
        AssignmentOutcome::Assigned(a) => {
            assignment_commitment(&a.request_id, &a.image, &a.placements)
        }
        AssignmentOutcome::Unsatisfiable {
            request_id,
            image,
            reason,
        } => unsatisfiable_commitment(request_id, image, reason),
    }
}

/// Whether an assignment's embedded commitment matches its contents.
pub fn verify_commitment(assignment: &DeploymentAssignment) -> bool {
    assignment_commitment(&assignment.request_id, &assignment.image, &assignment.placements)
        == assignment.commitment
}

/// Ledger anchor for a scheduling outcome.
pub fn anchor_for_outcome(outcome: &AssignmentOutcome) -> AnchorCommitment {
    AnchorCommitment {
        hash: outcome_commitment(outcome),
        subject: AnchorSubject::Outcome(outcome.clone()),
    }
}

/// Ledger anchor for a status digest.
pub fn anchor_for_status(
    node_id: &str,
    containers: BTreeMap<String, ContainerState>,
) -> AnchorCommitment {
    AnchorCommitment {
        hash: status_commitment(node_id, &containers),
        subject: AnchorSubject::Status {
            node_id: node_id.to_string(),
            containers,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placements(pairs: &[(&str, u32)]) -> BTreeMap<NodeId, u32> {
        pairs.iter().map(|(n, c)| (n.to_string(), *c)).collect()
    }

    #[test]
    fn commitment_is_order_independent_and_content_sensitive() {
        let a = assignment_commitment("req-1", "nginx", &placements(&[("a", 2), ("b", 1)]));
        let b = assignment_commitment("req-1", "nginx", &placements(&[("b", 1), ("a", 2)]));
        let c = assignment_commitment("req-1", "nginx", &placements(&[("a", 1), ("b", 2)]));
        let d = assignment_commitment("req-2", "nginx", &placements(&[("a", 2), ("b", 1)]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.0.len(), 64);
    }

    #[test]
    fn verify_detects_tampering() {
        let p = placements(&[("a", 2)]);
        let mut assignment = DeploymentAssignment {
            request_id: "req-1".into(),
            image: "nginx".into(),
            commitment: assignment_commitment("req-1", "nginx", &p),
            placements: p,
        };
        assert!(verify_commitment(&assignment));
        assignment.placements.insert("b".into(), 1);
        assert!(!verify_commitment(&assignment));
    }

    #[test]
    fn unsatisfiable_and_assigned_differ() {
        let empty = BTreeMap::new();
        assert_ne!(
            assignment_commitment("req-1", "nginx", &empty),
            unsatisfiable_commitment("req-1", "nginx", "")
        );
    }

    #[test]
    fn separators_inside_ids_cannot_forge_a_placement() {
        let split = assignment_commitment("req-1", "nginx", &placements(&[("a", 1), ("b", 2)]));
        let smuggled = assignment_commitment("req-1", "nginx", &placements(&[("a=1\nb", 2)]));
        assert_ne!(split, smuggled);

        let shifted = assignment_commitment("req-1\nnginx", "", &BTreeMap::new());
        assert_ne!(shifted, assignment_commitment("req-1", "nginx", &BTreeMap::new()));
    }

    #[test]
    fn status_digest_tracks_state() {
        let mut containers = BTreeMap::new();
        containers.insert("nginx:0".to_string(), ContainerState::Running);
        let before = status_commitment("node-1", &containers);
        containers.insert("nginx:0".to_string(), ContainerState::Healthy);
        assert_ne!(before, status_commitment("node-1", &containers));
    }
}
