//! Scale-down selection.
//!
//! An `ImageScaled` target applies to the replicas requested by operators
//! before the target was set. Each replica of those requests is a position,
//! ordered by (ledger sequence, node, index); a position whose replica
//! failed is followed through its replacement requests. Positions beyond
//! the target are surplus and get stopped by the node hosting them.
//!
//! Every node computes this from the same ledger-derived request records,
//! so all nodes agree on which replicas go without talking to each other.

use std::collections::{BTreeMap, BTreeSet};

use canteen_state::{AssignmentOutcome, ImageScale, ReplicaSlot, RequestOrigin, RequestRecord};

enum Resolved {
    Live(ReplicaSlot),
    /// The replacement could not be placed anywhere.
    Gone,
    /// A replacement is still waiting for its outcome.
    Unknown,
}

/// Replicas of `image` beyond its scale target, highest positions last.
/// Empty when no target is set or when some position is still unresolved,
/// in which case the caller tries again once more outcomes are anchored.
pub fn surplus_slots(records: &[RequestRecord], image: &str, scale: &ImageScale) -> Vec<ReplicaSlot> {
    let Some(target) = scale.target else {
        return Vec::new();
    };
    let current: Vec<&RequestRecord> = records
        .iter()
        .filter(|r| r.request.image == image && r.added_seq > scale.removed_seq)
        .collect();

    let mut operator: Vec<&RequestRecord> = current
        .iter()
        .copied()
        .filter(|r| r.request.origin == RequestOrigin::Operator && r.added_seq < target.seq)
        .collect();
    if operator.iter().any(|r| r.outcome.is_none()) {
        return Vec::new();
    }
    operator.sort_by_key(|r| r.added_seq);

    let mut replacements: BTreeMap<&ReplicaSlot, &RequestRecord> = BTreeMap::new();
    for record in &current {
        if let RequestOrigin::Reschedule { replaces } = &record.request.origin {
            replacements
                .entry(replaces)
                .and_modify(|held| {
                    if record.added_seq < held.added_seq {
                        *held = record;
                    }
                })
                .or_insert(record);
        }
    }

    let mut live = Vec::new();
    for slot in operator.iter().flat_map(|r| r.slots()) {
        match resolve(slot, &replacements) {
            Resolved::Live(slot) => live.push(slot),
            Resolved::Gone => {}
            Resolved::Unknown => return Vec::new(),
        }
    }
    live.into_iter().skip(target.replicas as usize).collect()
}

/// Follow `slot` through its chain of replacements to the replica that
/// currently holds the position.
fn resolve(mut slot: ReplicaSlot, replacements: &BTreeMap<&ReplicaSlot, &RequestRecord>) -> Resolved {
    let mut visited = BTreeSet::new();
    while let Some(record) = replacements.get(&slot) {
        if !visited.insert(slot.clone()) {
            return Resolved::Gone;
        }
        match &record.outcome {
            None => return Resolved::Unknown,
            Some(AssignmentOutcome::Unsatisfiable { .. }) => return Resolved::Gone,
            Some(AssignmentOutcome::Assigned(_)) => match record.slots().into_iter().next() {
                Some(next) => slot = next,
                None => return Resolved::Gone,
            },
        }
    }
    Resolved::Live(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canteen_state::{
        CommitmentHash, DeploymentAssignment, DeploymentRequest, PlacementConstraints, ScaleTarget,
    };

    fn record(
        id: &str,
        seq: u64,
        origin: RequestOrigin,
        placements: Option<&[(&str, u32)]>,
    ) -> RequestRecord {
        let outcome = placements.map(|placements| {
            AssignmentOutcome::Assigned(DeploymentAssignment {
                request_id: id.into(),
                image: "nginx".into(),
                commitment: CommitmentHash("test".into()),
                placements: placements.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
            })
        });
        RequestRecord {
            request: DeploymentRequest {
                id: id.into(),
                image: "nginx".into(),
                replicas: placements.map_or(1, |p| p.iter().map(|(_, c)| c).sum()),
                constraints: PlacementConstraints::default(),
                origin,
                created_at: 0,
            },
            outcome,
            commitment: None,
            added_seq: seq,
        }
    }

    fn slot(request_id: &str, node_id: &str, index: u32) -> ReplicaSlot {
        ReplicaSlot {
            request_id: request_id.into(),
            node_id: node_id.into(),
            index,
        }
    }

    fn scale(replicas: u32, seq: u64) -> ImageScale {
        ImageScale {
            removed_seq: 0,
            target: Some(ScaleTarget { replicas, seq }),
        }
    }

    #[test]
    fn no_target_means_no_surplus() {
        let records = vec![record("req-1", 1, RequestOrigin::Operator, Some(&[("node-a", 3)]))];
        assert!(surplus_slots(&records, "nginx", &ImageScale::default()).is_empty());
    }

    #[test]
    fn highest_positions_are_surplus() {
        let records = vec![
            record("req-1", 1, RequestOrigin::Operator, Some(&[("node-a", 2), ("node-b", 1)])),
            record("req-2", 4, RequestOrigin::Operator, Some(&[("node-b", 2)])),
        ];
        let surplus = surplus_slots(&records, "nginx", &scale(2, 9));
        assert_eq!(
            surplus,
            vec![slot("req-1", "node-b", 0), slot("req-2", "node-b", 0), slot("req-2", "node-b", 1)]
        );
        assert!(surplus_slots(&records, "nginx", &scale(5, 9)).is_empty());
        assert!(surplus_slots(&records, "redis", &scale(0, 9)).is_empty());
    }

    #[test]
    fn requests_after_the_target_are_untouched() {
        let records = vec![
            record("req-1", 1, RequestOrigin::Operator, Some(&[("node-a", 2)])),
            record("req-2", 8, RequestOrigin::Operator, Some(&[("node-a", 2)])),
        ];
        let surplus = surplus_slots(&records, "nginx", &scale(1, 5));
        assert_eq!(surplus, vec![slot("req-1", "node-a", 1)]);
    }

    #[test]
    fn unplaced_requests_defer_the_decision() {
        let records = vec![
            record("req-1", 1, RequestOrigin::Operator, Some(&[("node-a", 2)])),
            record("req-2", 2, RequestOrigin::Operator, None),
        ];
        assert!(surplus_slots(&records, "nginx", &scale(1, 5)).is_empty());
    }

    #[test]
    fn failed_positions_follow_their_replacement() {
        let replaces = slot("req-1", "node-a", 1);
        let records = vec![
            record("req-1", 1, RequestOrigin::Operator, Some(&[("node-a", 2)])),
            record(
                "req-3",
                6,
                RequestOrigin::Reschedule {
                    replaces: replaces.clone(),
                },
                Some(&[("node-c", 1)]),
            ),
        ];
        let surplus = surplus_slots(&records, "nginx", &scale(1, 5));
        assert_eq!(surplus, vec![slot("req-3", "node-c", 0)]);

        let mut unplaced = records.clone();
        unplaced[1].outcome = None;
        assert!(surplus_slots(&unplaced, "nginx", &scale(1, 5)).is_empty());
    }

    #[test]
    fn requests_before_a_removal_are_ignored() {
        let records = vec![
            record("req-1", 1, RequestOrigin::Operator, Some(&[("node-a", 3)])),
            record("req-2", 5, RequestOrigin::Operator, Some(&[("node-b", 2)])),
        ];
        let scale = ImageScale {
            removed_seq: 3,
            target: Some(ScaleTarget { replicas: 1, seq: 7 }),
        };
        assert_eq!(surplus_slots(&records, "nginx", &scale), vec![slot("req-2", "node-b", 1)]);
    }

    #[test]
    fn replacement_cycles_terminate() {
        let first = slot("req-1", "node-a", 0);
        let mut records = vec![
            record("req-1", 1, RequestOrigin::Operator, Some(&[("node-a", 1)])),
            record(
                "req-2",
                2,
                RequestOrigin::Reschedule {
                    replaces: first.clone(),
                },
                Some(&[("node-a", 1)]),
            ),
            record("req-3", 3, RequestOrigin::Operator, Some(&[("node-b", 2)])),
        ];
        // A replacement whose assignment points back at the slot it replaces.
        if let Some(AssignmentOutcome::Assigned(assignment)) = &mut records[1].outcome {
            assignment.request_id = first.request_id.clone();
        }
        assert_eq!(
            surplus_slots(&records, "nginx", &scale(1, 9)),
            vec![slot("req-3", "node-b", 1)]
        );
    }
}
