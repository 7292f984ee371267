//! Per-request leader election.
//!
//! Every node evaluates the same function over its own ALIVE set, so nodes
//! with converged views agree on the leader without any extra messages.
//! Rendezvous hashing spreads leadership for different requests across the
//! cluster; ties (equal weights) fall to the lexicographically lowest id.

use std::collections::BTreeSet;

use canteen_state::NodeId;
use sha2::{Digest, Sha256};

fn weight(request_id: &str, node_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(node_id.as_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(word)
}

/// Leader for `request_id` among `alive`, or `None` for an empty set.
pub fn elect_leader(request_id: &str, alive: &BTreeSet<NodeId>) -> Option<NodeId> {
    let mut best: Option<(&NodeId, u64)> = None;
    // Ascending iteration with a strict comparison keeps the lowest id on ties.
    for node in alive {
        let w = weight(request_id, node);
        if best.is_none_or(|(_, bw)| w > bw) {
            best = Some((node, w));
        }
    }
    best.map(|(node, _)| node.clone())
}

pub fn is_leader(request_id: &str, alive: &BTreeSet<NodeId>, local_id: &str) -> bool {
    elect_leader(request_id, alive).is_some_and(|leader| leader == local_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_set_has_no_leader() {
        assert_eq!(elect_leader("req-1", &BTreeSet::new()), None);
    }

    #[test]
    fn single_node_leads() {
        assert_eq!(elect_leader("req-1", &set(&["a"])), Some("a".to_string()));
    }

    #[test]
    fn same_view_same_leader() {
        let alive = set(&["node-1", "node-2", "node-3", "node-4"]);
        let leader = elect_leader("req-00000007", &alive).unwrap();
        for local in &alive {
            assert_eq!(is_leader("req-00000007", &alive, local), *local == leader);
        }
    }

    #[test]
    fn leadership_spreads_across_requests() {
        let alive = set(&["node-1", "node-2", "node-3", "node-4"]);
        let leaders: BTreeSet<NodeId> = (0..64)
            .filter_map(|i| elect_leader(&format!("req-{i:08}"), &alive))
            .collect();
        assert!(leaders.len() > 1);
    }

    #[test]
    fn removing_a_non_leader_keeps_leader() {
        let alive = set(&["node-1", "node-2", "node-3"]);
        let leader = elect_leader("req-1", &alive).unwrap();
        let other = alive.iter().find(|id| **id != leader).unwrap().clone();
        let mut shrunk = alive.clone();
        shrunk.remove(&other);
        assert_eq!(elect_leader("req-1", &shrunk), Some(leader));
    }
}
