//! Bounded-fanout dissemination queue.
//!
//! Every update the node learns (or originates) is retransmitted on a
//! limited number of outgoing envelopes, `mult * ceil(log2(n + 1))`, and
//! then dropped. Items are keyed; a newer version replaces an older one and
//! resets its transmit count. The version map outlives the active queue so
//! that a payload that comes back around is recognised as already seen and
//! is not re-gossiped. Versions of retired items are kept up to a capacity
//! and forgotten oldest first; versions of active items are always kept.

use std::collections::{HashMap, VecDeque};

use crate::message::Piggyback;

/// Retired keys whose versions are remembered by default.
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

struct Pending {
    item: Piggyback,
    transmits: u32,
}

pub struct DisseminationQueue {
    active: HashMap<String, Pending>,
    versions: HashMap<String, u64>,
    /// Keys that left the active queue, oldest first.
    retired: VecDeque<String>,
    seen_capacity: usize,
    retransmit_mult: u32,
}

impl DisseminationQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self::with_seen_capacity(retransmit_mult, DEFAULT_SEEN_CAPACITY)
    }

    pub fn with_seen_capacity(retransmit_mult: u32, seen_capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            versions: HashMap::new(),
            retired: VecDeque::new(),
            seen_capacity,
            retransmit_mult: retransmit_mult.max(1),
        }
    }

    /// Queue `item` if it is newer than anything seen under its key.
    /// Returns true when the item was new.
    pub fn push(&mut self, item: Piggyback) -> bool {
        let key = item.key();
        let version = item.version();
        if let Some(&seen) = self.versions.get(&key) {
            if seen >= version {
                return false;
            }
        }
        self.versions.insert(key.clone(), version);
        self.active.insert(key, Pending { item, transmits: 0 });
        true
    }

    /// How many times each item is sent for a cluster of `cluster_size`.
    pub fn retransmit_limit(&self, cluster_size: usize) -> u32 {
        let log = ((cluster_size as f64) + 1.0).log2().ceil().max(1.0) as u32;
        self.retransmit_mult * log
    }

    /// Take up to `max` items for one outgoing envelope, least-sent first.
    pub fn select(&mut self, max: usize, cluster_size: usize) -> Vec<Piggyback> {
        let limit = self.retransmit_limit(cluster_size);
        let mut keys: Vec<(u32, String)> = self
            .active
            .iter()
            .map(|(k, p)| (p.transmits, k.clone()))
            .collect();
        keys.sort();
        keys.truncate(max);

        let mut out = Vec::with_capacity(keys.len());
        for (_, key) in keys {
            let exhausted = match self.active.get_mut(&key) {
                Some(pending) => {
                    pending.transmits += 1;
                    out.push(pending.item.clone());
                    pending.transmits >= limit
                }
                None => false,
            };
            if exhausted {
                self.active.remove(&key);
                self.retire(key);
            }
        }
        out
    }

    fn retire(&mut self, key: String) {
        self.retired.push_back(key);
        while self.retired.len() > self.seen_capacity {
            let Some(oldest) = self.retired.pop_front() else {
                break;
            };
            if !self.active.contains_key(&oldest) && !self.retired.contains(&oldest) {
                self.versions.remove(&oldest);
            }
        }
    }

    /// Number of keys whose latest version is remembered.
    pub fn seen_len(&self) -> usize {
        self.versions.len()
    }

    /// Number of items still being retransmitted.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MemberUpdate;
    use canteen_state::LivenessState;

    fn member(id: &str, incarnation: u64, state: LivenessState) -> Piggyback {
        Piggyback::Membership(MemberUpdate {
            id: id.to_string(),
            address: String::new(),
            public_key_share: String::new(),
            incarnation,
            state,
        })
    }

    #[test]
    fn retransmit_limit_grows_logarithmically() {
        let q = DisseminationQueue::new(3);
        assert_eq!(q.retransmit_limit(1), 3);
        assert_eq!(q.retransmit_limit(3), 6);
        assert_eq!(q.retransmit_limit(7), 9);
        assert_eq!(q.retransmit_limit(100), 21);
    }

    #[test]
    fn items_drop_after_limit() {
        let mut q = DisseminationQueue::new(1);
        q.push(member("a", 1, LivenessState::Suspect));
        // cluster of 1 → limit 1
        assert_eq!(q.select(8, 1).len(), 1);
        assert!(q.is_empty());
        assert!(q.select(8, 1).is_empty());
    }

    #[test]
    fn stale_versions_are_rejected() {
        let mut q = DisseminationQueue::new(2);
        assert!(q.push(member("a", 2, LivenessState::Alive)));
        assert!(!q.push(member("a", 1, LivenessState::Dead)));
        assert!(!q.push(member("a", 2, LivenessState::Alive)));
        assert!(q.push(member("a", 2, LivenessState::Suspect)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn seen_versions_outlive_the_queue() {
        let mut q = DisseminationQueue::new(1);
        q.push(member("a", 1, LivenessState::Alive));
        q.select(8, 1);
        assert!(q.is_empty());
        // Same update gossiped back to us must not be re-queued.
        assert!(!q.push(member("a", 1, LivenessState::Alive)));
    }

    #[test]
    fn select_prefers_least_transmitted() {
        let mut q = DisseminationQueue::new(4);
        q.push(member("a", 1, LivenessState::Alive));
        assert_eq!(q.select(1, 3).len(), 1);
        q.push(member("b", 1, LivenessState::Alive));
        let next = q.select(1, 3);
        assert_eq!(next[0].key(), "m:b");
    }

    #[test]
    fn retired_versions_are_bounded() {
        let mut q = DisseminationQueue::with_seen_capacity(1, 2);
        for id in ["a", "b", "c", "d"] {
            q.push(member(id, 1, LivenessState::Alive));
            q.select(8, 1);
        }
        assert!(q.is_empty());
        assert_eq!(q.seen_len(), 2);
        // The two most recent are still recognised, the oldest are forgotten.
        assert!(!q.push(member("d", 1, LivenessState::Alive)));
        assert!(!q.push(member("c", 1, LivenessState::Alive)));
        assert!(q.push(member("a", 1, LivenessState::Alive)));
    }

    #[test]
    fn active_versions_are_never_forgotten() {
        let mut q = DisseminationQueue::with_seen_capacity(1, 0);
        q.push(member("a", 1, LivenessState::Alive));
        q.push(member("b", 1, LivenessState::Alive));
        assert_eq!(q.select(1, 1).len(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.seen_len(), 1);
        assert!(!q.push(member("b", 1, LivenessState::Alive)));
    }
}
