//! Peer wire message.
//!
//! Every gossip exchange is a single request/response pair of [`Envelope`]s.
//! The envelope header always carries the sender's own liveness claim; the
//! piggyback list carries membership updates and any other payloads being
//! disseminated (telemetry ciphertexts, container status, assignment
//! notices). The format is transport-agnostic JSON.

use serde::{Deserialize, Serialize};

use canteen_state::{
    AssignmentNotice, LivenessState, NodeId, StatusUpdate, TelemetryRecord,
};

/// A claim about one member's liveness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberUpdate {
    pub id: NodeId,
    pub address: String,
    #[serde(default)]
    pub public_key_share: String,
    pub incarnation: u64,
    pub state: LivenessState,
}

impl MemberUpdate {
    /// Total order used by the merge rule: incarnation first, then
    /// DEAD > SUSPECT > ALIVE.
    pub fn rank(&self) -> (u64, u8) {
        (self.incarnation, self.state.precedence())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// First contact with a bootstrap peer.
    Join,
    Ping {
        seq: u64,
    },
    Ack {
        seq: u64,
    },
    /// Indirect probe outcome: the helper could not reach the target.
    Nack {
        seq: u64,
    },
    /// Ask the receiver to probe `target` on the sender's behalf.
    PingReq {
        seq: u64,
        target: NodeId,
        target_address: String,
    },
}

/// A payload riding on an envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "payload", content = "data", rename_all = "snake_case")]
pub enum Piggyback {
    Membership(MemberUpdate),
    Telemetry(TelemetryRecord),
    Status(StatusUpdate),
    Assignment(AssignmentNotice),
}

impl Piggyback {
    /// Dissemination key. A newer version replaces an older one under the same key.
    pub fn key(&self) -> String {
        match self {
            Piggyback::Membership(u) => format!("m:{}", u.id),
            Piggyback::Telemetry(t) => format!("t:{}", t.node_id),
            Piggyback::Status(s) => format!("s:{}:{}", s.node_id, s.container_key),
            Piggyback::Assignment(a) => format!("a:{}", a.outcome.request_id()),
        }
    }

    /// Monotonic version within a key.
    ///
    /// Membership versions encode the merge rule, so a higher version is
    /// exactly an update that supersedes.
    pub fn version(&self) -> u64 {
        match self {
            Piggyback::Membership(u) => {
                u.incarnation.saturating_mul(3) + u.state.precedence() as u64
            }
            Piggyback::Telemetry(t) => t.timestamp,
            Piggyback::Status(s) => s.updated_at,
            // First anchored outcome wins; later notices for the same request are duplicates.
            Piggyback::Assignment(_) => 1,
        }
    }
}

/// The unit exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub sender: NodeId,
    pub sender_address: String,
    pub incarnation: u64,
    pub state: LivenessState,
    pub kind: MessageKind,
    #[serde(default)]
    pub piggyback: Vec<Piggyback>,
}

impl Envelope {
    /// The sender's claim about itself, as a membership update.
    pub fn sender_update(&self) -> MemberUpdate {
        MemberUpdate {
            id: self.sender.clone(),
            address: self.sender_address.clone(),
            public_key_share: String::new(),
            incarnation: self.incarnation,
            state: self.state,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.kind, MessageKind::Ack { .. })
    }
}
