//! Membership core — the SWIM state machine, free of I/O.
//!
//! `Membership` owns one node's Cluster View and its dissemination queue.
//! It is driven in rounds by the swim actor: [`Membership::tick`] advances
//! the round, promotes expired suspicions to DEAD and picks probe targets;
//! the actor reports probe outcomes back and feeds every received envelope
//! through [`Membership::absorb`]. Keeping the core synchronous lets the
//! tests below drive whole clusters deterministically.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use canteen_state::*;

use crate::dissemination::DisseminationQueue;
use crate::message::{Envelope, MemberUpdate, MessageKind, Piggyback};

/// Tuning knobs for the failure detector.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Peers probed directly per round.
    pub probe_fanout: usize,
    /// Helpers asked to probe a target indirectly after a direct miss.
    pub indirect_probes: usize,
    /// Rounds a member stays SUSPECT before it is declared DEAD.
    pub suspicion_rounds: u64,
    /// Multiplier for the per-update retransmit limit.
    pub retransmit_mult: u32,
    /// Maximum piggybacked items per envelope.
    pub max_piggyback: usize,
    /// Every this many rounds one DEAD member is also pinged, so that
    /// views split by a healed partition can reconcile. 0 disables.
    pub dead_probe_interval: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            probe_fanout: 2,
            indirect_probes: 3,
            suspicion_rounds: 5,
            retransmit_mult: 3,
            max_piggyback: 8,
            dead_probe_interval: 5,
        }
    }
}

/// A peer to probe this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub id: NodeId,
    pub address: String,
}

/// Work produced by one protocol round.
#[derive(Debug, Clone, Default)]
pub struct RoundPlan {
    pub round: u64,
    pub probes: Vec<ProbeTarget>,
    /// Members promoted from SUSPECT to DEAD this round.
    pub declared_dead: Vec<NodeId>,
}

struct MemberEntry {
    record: MemberRecord,
    /// Round in which the current suspicion started.
    suspected_at: Option<u64>,
}

/// One node's SWIM state.
pub struct Membership {
    local: MemberRecord,
    members: BTreeMap<NodeId, MemberEntry>,
    round: u64,
    left: bool,
    config: MembershipConfig,
    queue: DisseminationQueue,
    rng: StdRng,
}

impl Membership {
    /// Create the core for a node starting a new life at `incarnation`.
    pub fn new(
        local_id: &str,
        address: &str,
        public_key_share: &str,
        incarnation: u64,
        config: MembershipConfig,
        rng: StdRng,
    ) -> Self {
        let local = MemberRecord {
            id: local_id.to_string(),
            address: address.to_string(),
            public_key_share: public_key_share.to_string(),
            state: LivenessState::Alive,
            incarnation,
            last_seen: epoch_millis(),
        };
        let mut queue = DisseminationQueue::new(config.retransmit_mult);
        queue.push(Piggyback::Membership(update_of(&local)));
        Self {
            local,
            members: BTreeMap::new(),
            round: 0,
            left: false,
            config,
            queue,
            rng,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local.id
    }

    pub fn local_address(&self) -> &str {
        &self.local.address
    }

    pub fn incarnation(&self) -> u64 {
        self.local.incarnation
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Advance one protocol round.
    pub fn tick(&mut self) -> RoundPlan {
        self.round += 1;
        let round = self.round;
        let limit = self.config.suspicion_rounds;

        let mut declared_dead = Vec::new();
        for (id, entry) in self.members.iter_mut() {
            if entry.record.state != LivenessState::Suspect {
                continue;
            }
            let since = entry.suspected_at.unwrap_or(round);
            if round.saturating_sub(since) >= limit {
                entry.record.state = LivenessState::Dead;
                entry.suspected_at = None;
                warn!(node = %id, incarnation = entry.record.incarnation, round, "suspect declared dead");
                declared_dead.push(id.clone());
            }
        }
        for id in &declared_dead {
            if let Some(entry) = self.members.get(id) {
                self.queue.push(Piggyback::Membership(update_of(&entry.record)));
            }
        }

        let probes = if self.left {
            Vec::new()
        } else {
            let candidates = self.targets(|r| r.state != LivenessState::Dead);
            let mut probes: Vec<ProbeTarget> = candidates
                .choose_multiple(&mut self.rng, self.config.probe_fanout)
                .cloned()
                .collect();
            let interval = self.config.dead_probe_interval;
            if interval > 0 && round % interval == 0 {
                let dead = self.targets(|r| r.state == LivenessState::Dead);
                if let Some(target) = dead.choose(&mut self.rng) {
                    probes.push(target.clone());
                }
            }
            probes
        };

        RoundPlan {
            round,
            probes,
            declared_dead,
        }
    }

    /// Record a successful direct or indirect probe.
    pub fn probe_succeeded(&mut self, id: &str) {
        if let Some(entry) = self.members.get_mut(id) {
            entry.record.last_seen = epoch_millis();
        }
    }

    /// Record a failed probe. Returns true if the member became SUSPECT.
    pub fn probe_failed(&mut self, id: &str) -> bool {
        let round = self.round;
        let Some(entry) = self.members.get_mut(id) else {
            return false;
        };
        if entry.record.state != LivenessState::Alive {
            return false;
        }
        entry.record.state = LivenessState::Suspect;
        entry.suspected_at = Some(round);
        info!(node = %id, incarnation = entry.record.incarnation, round, "member suspected");
        let update = update_of(&entry.record);
        self.queue.push(Piggyback::Membership(update));
        true
    }

    /// Merge a liveness claim into the view. Returns true if the view changed.
    ///
    /// A claim about this node that is not ALIVE (at or above the current
    /// incarnation) is refuted by bumping the local incarnation.
    pub fn apply(&mut self, update: MemberUpdate) -> bool {
        if update.id == self.local.id {
            return self.maybe_refute(&update);
        }

        let round = self.round;
        let now = epoch_millis();
        match self.members.get_mut(&update.id) {
            Some(entry) => {
                if update.rank() <= (entry.record.incarnation, entry.record.state.precedence()) {
                    if update.rank() == (entry.record.incarnation, entry.record.state.precedence()) {
                        entry.record.last_seen = now;
                    }
                    return false;
                }
                let previous = entry.record.state;
                entry.record.state = update.state;
                entry.record.incarnation = update.incarnation;
                entry.record.last_seen = now;
                if !update.address.is_empty() {
                    entry.record.address = update.address.clone();
                }
                if !update.public_key_share.is_empty() {
                    entry.record.public_key_share = update.public_key_share.clone();
                }
                entry.suspected_at = (update.state == LivenessState::Suspect).then_some(round);
                if previous != update.state {
                    info!(
                        node = %update.id,
                        from = %previous,
                        to = %update.state,
                        incarnation = update.incarnation,
                        "member state changed"
                    );
                }
            }
            None => {
                debug!(node = %update.id, state = %update.state, "learned new member");
                self.members.insert(
                    update.id.clone(),
                    MemberEntry {
                        record: MemberRecord {
                            id: update.id.clone(),
                            address: update.address.clone(),
                            public_key_share: update.public_key_share.clone(),
                            state: update.state,
                            incarnation: update.incarnation,
                            last_seen: now,
                        },
                        suspected_at: (update.state == LivenessState::Suspect).then_some(round),
                    },
                );
            }
        }
        // Carry the public key share forward if the sender header omitted it.
        let mut relayed = update;
        if relayed.public_key_share.is_empty() {
            if let Some(entry) = self.members.get(&relayed.id) {
                relayed.public_key_share = entry.record.public_key_share.clone();
            }
        }
        self.queue.push(Piggyback::Membership(relayed));
        true
    }

    /// Build an outgoing envelope. If `recipient` is a member this node
    /// holds as SUSPECT or DEAD, that claim rides along so the recipient
    /// can refute it.
    pub fn envelope(&mut self, kind: MessageKind, recipient: Option<&str>) -> Envelope {
        let cluster_size = self.members.len() + 1;
        let mut piggyback = Vec::new();
        if let Some(entry) = recipient.and_then(|id| self.members.get(id)) {
            if entry.record.state != LivenessState::Alive {
                piggyback.push(Piggyback::Membership(update_of(&entry.record)));
            }
        }
        piggyback.extend(self.queue.select(self.config.max_piggyback, cluster_size));
        Envelope {
            sender: self.local.id.clone(),
            sender_address: self.local.address.clone(),
            incarnation: self.local.incarnation,
            state: self.local.state,
            kind,
            piggyback,
        }
    }

    /// Apply an incoming envelope. Returns the non-membership payloads that
    /// were new to this node (already queued for re-gossip).
    pub fn absorb(&mut self, envelope: &Envelope) -> Vec<Piggyback> {
        if envelope.sender != self.local.id {
            self.apply(envelope.sender_update());
        }
        let mut fresh = Vec::new();
        for item in &envelope.piggyback {
            match item {
                Piggyback::Membership(update) => {
                    self.apply(update.clone());
                }
                other => {
                    if self.queue.push(other.clone()) {
                        fresh.push(other.clone());
                    }
                }
            }
        }
        fresh
    }

    /// Queue a locally originated payload for dissemination.
    pub fn publish(&mut self, item: Piggyback) -> bool {
        self.queue.push(item)
    }

    /// Up to `indirect_probes` random ALIVE members other than `target`.
    pub fn indirect_helpers(&mut self, target: &str) -> Vec<ProbeTarget> {
        let candidates =
            self.targets(|r| r.state == LivenessState::Alive && r.id != target);
        candidates
            .choose_multiple(&mut self.rng, self.config.indirect_probes)
            .cloned()
            .collect()
    }

    /// Address of a known member.
    pub fn address_of(&self, id: &str) -> Option<String> {
        self.members.get(id).map(|e| e.record.address.clone())
    }

    /// Announce a graceful departure. Returns peers worth notifying directly.
    pub fn leave(&mut self) -> Vec<ProbeTarget> {
        self.left = true;
        self.local.incarnation += 1;
        self.local.state = LivenessState::Dead;
        self.queue.push(Piggyback::Membership(update_of(&self.local)));
        info!(node = %self.local.id, incarnation = self.local.incarnation, "leaving cluster");
        let mut peers = self.targets(|r| r.state == LivenessState::Alive);
        peers.truncate(self.config.probe_fanout.max(1) * 2);
        peers
    }

    /// Snapshot of the view, including the local node, sorted by id.
    pub fn current_view(&self) -> ClusterView {
        let mut members: Vec<MemberRecord> =
            self.members.values().map(|e| e.record.clone()).collect();
        members.push(self.local.clone());
        members.sort_by(|a, b| a.id.cmp(&b.id));
        ClusterView {
            local_id: self.local.id.clone(),
            members,
        }
    }

    /// Number of known members, excluding the local node.
    pub fn peer_count(&self) -> usize {
        self.members.len()
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn maybe_refute(&mut self, update: &MemberUpdate) -> bool {
        if self.left || update.state == LivenessState::Alive {
            return false;
        }
        if update.incarnation < self.local.incarnation {
            return false;
        }
        let claimed = update.incarnation;
        self.local.incarnation = claimed + 1;
        info!(
            claimed_state = %update.state,
            claimed_incarnation = claimed,
            incarnation = self.local.incarnation,
            "refuting liveness claim"
        );
        self.queue.push(Piggyback::Membership(update_of(&self.local)));
        true
    }

    fn targets(&self, keep: impl Fn(&MemberRecord) -> bool) -> Vec<ProbeTarget> {
        self.members
            .values()
            .filter(|e| keep(&e.record))
            .map(|e| ProbeTarget {
                id: e.record.id.clone(),
                address: e.record.address.clone(),
            })
            .collect()
    }
}

fn update_of(record: &MemberRecord) -> MemberUpdate {
    MemberUpdate {
        id: record.id.clone(),
        address: record.address.clone(),
        public_key_share: record.public_key_share.clone(),
        incarnation: record.incarnation,
        state: record.state,
    }
}

/// Generate a fresh node id from the advertised address.
pub fn generate_node_id(address: &str) -> NodeId {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    address.hash(&mut hasher);
    epoch_millis().hash(&mut hasher);
    rand::random::<u64>().hash(&mut hasher);
    format!("node-{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn core(id: &str, seed: u64, config: MembershipConfig) -> Membership {
        Membership::new(
            id,
            &format!("{id}:5000"),
            "",
            1,
            config,
            StdRng::seed_from_u64(seed),
        )
    }

    fn update(id: &str, incarnation: u64, state: LivenessState) -> MemberUpdate {
        MemberUpdate {
            id: id.to_string(),
            address: format!("{id}:5000"),
            public_key_share: String::new(),
            incarnation,
            state,
        }
    }

    // ── Merge rule ─────────────────────────────────────────────────

    #[test]
    fn higher_incarnation_wins() {
        let mut m = core("a", 1, MembershipConfig::default());
        assert!(m.apply(update("b", 1, LivenessState::Alive)));
        assert!(m.apply(update("b", 1, LivenessState::Suspect)));
        // Stale alive at the same incarnation does not clear the suspicion.
        assert!(!m.apply(update("b", 1, LivenessState::Alive)));
        assert_eq!(m.current_view().state_of("b"), Some(LivenessState::Suspect));
        // Refutation with a higher incarnation does.
        assert!(m.apply(update("b", 2, LivenessState::Alive)));
        assert_eq!(m.current_view().state_of("b"), Some(LivenessState::Alive));
    }

    #[test]
    fn dead_beats_suspect_at_equal_incarnation() {
        let mut m = core("a", 1, MembershipConfig::default());
        m.apply(update("b", 3, LivenessState::Suspect));
        assert!(m.apply(update("b", 3, LivenessState::Dead)));
        assert!(!m.apply(update("b", 3, LivenessState::Suspect)));
        assert_eq!(m.current_view().state_of("b"), Some(LivenessState::Dead));
    }

    #[test]
    fn rejoin_with_higher_incarnation_overrides_dead() {
        let mut m = core("a", 1, MembershipConfig::default());
        m.apply(update("b", 4, LivenessState::Dead));
        assert!(m.apply(update("b", 5, LivenessState::Alive)));
        let view = m.current_view();
        let b = view.get("b").unwrap();
        assert_eq!(b.state, LivenessState::Alive);
        assert_eq!(b.incarnation, 5);
    }

    #[test]
    fn local_node_refutes_suspicion() {
        let mut m = core("a", 1, MembershipConfig::default());
        assert!(m.apply(update("a", 1, LivenessState::Suspect)));
        assert_eq!(m.incarnation(), 2);
        // Old claims below the current incarnation are ignored.
        assert!(!m.apply(update("a", 1, LivenessState::Dead)));
        assert_eq!(m.incarnation(), 2);
        assert_eq!(m.current_view().state_of("a"), Some(LivenessState::Alive));
    }

    // ── Suspicion timeout ──────────────────────────────────────────

    #[test]
    fn suspect_becomes_dead_after_k_rounds() {
        let config = MembershipConfig {
            suspicion_rounds: 4,
            ..MembershipConfig::default()
        };
        let mut a = core("a", 1, config.clone());
        let mut c = core("c", 2, config);
        for m in [&mut a, &mut c] {
            m.apply(update("b", 1, LivenessState::Alive));
        }

        // Round N: a suspects b directly, c hears it through gossip.
        a.tick();
        c.tick();
        assert!(a.probe_failed("b"));
        c.apply(update("b", 1, LivenessState::Suspect));

        for _ in 0..3 {
            a.tick();
            c.tick();
            assert_eq!(a.current_view().state_of("b"), Some(LivenessState::Suspect));
            assert_eq!(c.current_view().state_of("b"), Some(LivenessState::Suspect));
        }

        // Round N + K.
        let plan_a = a.tick();
        let plan_c = c.tick();
        assert_eq!(plan_a.declared_dead, vec!["b".to_string()]);
        assert_eq!(plan_c.declared_dead, vec!["b".to_string()]);
        assert_eq!(a.current_view().state_of("b"), Some(LivenessState::Dead));
        // Dead members drop out of regular probing (round 6 is not a reconnect round).
        assert!(a.tick().probes.iter().all(|p| p.id != "b"));
    }

    #[test]
    fn leave_announces_dead_and_stops_probing() {
        let mut m = core("a", 1, MembershipConfig::default());
        m.apply(update("b", 1, LivenessState::Alive));
        let notify = m.leave();
        assert_eq!(notify.len(), 1);
        assert_eq!(m.incarnation(), 2);
        assert!(m.tick().probes.is_empty());
        let env = m.envelope(MessageKind::Ping { seq: 1 }, None);
        assert_eq!(env.state, LivenessState::Dead);
        // A departed node does not refute its own death.
        assert!(!m.apply(update("a", 2, LivenessState::Dead)));
    }

    #[test]
    fn envelope_carries_claim_about_recipient() {
        let mut m = core("a", 1, MembershipConfig::default());
        m.apply(update("b", 1, LivenessState::Alive));
        m.probe_failed("b");
        let env = m.envelope(MessageKind::Ping { seq: 1 }, Some("b"));
        assert!(env.piggyback.iter().any(|p| matches!(
            p,
            Piggyback::Membership(u) if u.id == "b" && u.state == LivenessState::Suspect
        )));
    }

    // ── Simulated clusters ─────────────────────────────────────────

    /// Lock-step cluster simulation over a lossy in-process network.
    struct Sim {
        nodes: Vec<Membership>,
        up: Vec<bool>,
        loss: f64,
        rng: StdRng,
    }

    impl Sim {
        fn new(n: usize, config: MembershipConfig, seed: u64) -> Self {
            let nodes = (0..n)
                .map(|i| core(&format!("n{i:02}"), seed + i as u64, config.clone()))
                .collect();
            let mut sim = Self {
                nodes,
                up: vec![true; n],
                loss: 0.0,
                rng: StdRng::seed_from_u64(seed ^ 0xfeed),
            };
            for i in 1..n {
                sim.exchange(i, 0, MessageKind::Join);
            }
            sim
        }

        fn index(&self, id: &str) -> usize {
            self.nodes.iter().position(|m| m.local_id() == id).unwrap()
        }

        fn lost(&mut self) -> bool {
            self.loss > 0.0 && self.rng.gen_bool(self.loss)
        }

        /// One request/response exchange. Returns true if the reply arrived.
        fn exchange(&mut self, from: usize, to: usize, kind: MessageKind) -> bool {
            if !self.up[to] || self.lost() {
                return false;
            }
            let to_id = self.nodes[to].local_id().to_string();
            let from_id = self.nodes[from].local_id().to_string();
            let request = self.nodes[from].envelope(kind, Some(&to_id));
            self.nodes[to].absorb(&request);
            let reply = self.nodes[to].envelope(MessageKind::Ack { seq: 0 }, Some(&from_id));
            if self.lost() {
                return false;
            }
            self.nodes[from].absorb(&reply);
            true
        }

        fn round(&mut self) {
            for i in 0..self.nodes.len() {
                if !self.up[i] {
                    continue;
                }
                let plan = self.nodes[i].tick();
                for target in plan.probes {
                    let j = self.index(&target.id);
                    let mut ok = self.exchange(i, j, MessageKind::Ping { seq: 0 });
                    if !ok {
                        for helper in self.nodes[i].indirect_helpers(&target.id) {
                            let h = self.index(&helper.id);
                            if self.exchange(i, h, MessageKind::Ping { seq: 0 })
                                && self.exchange(h, j, MessageKind::Ping { seq: 0 })
                            {
                                ok = true;
                                break;
                            }
                        }
                    }
                    if ok {
                        self.nodes[i].probe_succeeded(&target.id);
                    } else {
                        self.nodes[i].probe_failed(&target.id);
                    }
                }
            }
        }

        fn live_views_agree(&self, expected: &dyn Fn(&str) -> LivenessState) -> bool {
            let ids: Vec<String> = self.nodes.iter().map(|m| m.local_id().to_string()).collect();
            self.nodes
                .iter()
                .zip(&self.up)
                .filter(|(_, up)| **up)
                .all(|(m, _)| {
                    let view = m.current_view();
                    ids.iter().all(|id| view.state_of(id) == Some(expected(id)))
                })
        }
    }

    #[test]
    fn cluster_converges_under_message_loss() {
        let config = MembershipConfig {
            suspicion_rounds: 3,
            ..MembershipConfig::default()
        };
        let mut sim = Sim::new(10, config, 7);
        sim.loss = 0.1;
        for _ in 0..20 {
            sim.round();
        }

        // Crash one node while the network is still lossy.
        let crashed = sim.nodes[9].local_id().to_string();
        sim.up[9] = false;
        for _ in 0..30 {
            sim.round();
        }

        // Loss stops; outstanding false suspicions get refuted.
        sim.loss = 0.0;
        let mut rounds = 0;
        let expected = |id: &str| {
            if id == crashed {
                LivenessState::Dead
            } else {
                LivenessState::Alive
            }
        };
        while !sim.live_views_agree(&expected) {
            sim.round();
            rounds += 1;
            assert!(rounds < 60, "views did not converge");
        }
    }

    #[test]
    fn refuted_suspect_returns_to_alive_everywhere() {
        let config = MembershipConfig {
            suspicion_rounds: 10,
            ..MembershipConfig::default()
        };
        let mut sim = Sim::new(3, config, 11);
        for _ in 0..3 {
            sim.round();
        }
        let b = sim.nodes[2].local_id().to_string();
        assert!(sim.nodes[0].probe_failed(&b));

        for _ in 0..3 {
            sim.round();
        }
        assert!(sim.nodes[2].incarnation() >= 2);
        for m in &sim.nodes {
            let view = m.current_view();
            let rec = view.get(&b).unwrap();
            assert_eq!(rec.state, LivenessState::Alive, "view of {}", m.local_id());
            assert!(rec.incarnation >= 2);
        }
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = generate_node_id("10.0.0.1:5000");
        let b = generate_node_id("10.0.0.1:5000");
        assert!(a.starts_with("node-"));
        assert_ne!(a, b);
    }
}
