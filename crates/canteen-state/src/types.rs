//! Domain types shared by every Canteen crate.
//!
//! These cover cluster membership, encrypted telemetry, deployment requests
//! and their outcomes, ledger events, and container lifecycle records. All
//! types are serializable to/from JSON, both for storage in redb tables and
//! for the gossip and ledger wire formats.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique, stable identifier for a node in the cluster.
pub type NodeId = String;

/// Identifier of a deployment request (assigned by the ledger).
pub type RequestId = String;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Membership ────────────────────────────────────────────────────

/// Liveness of a cluster member as seen by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    Alive,
    Suspect,
    Dead,
}

impl LivenessState {
    /// Precedence used to break ties at equal incarnation:
    /// DEAD > SUSPECT > ALIVE.
    pub fn precedence(self) -> u8 {
        match self {
            LivenessState::Alive => 0,
            LivenessState::Suspect => 1,
            LivenessState::Dead => 2,
        }
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LivenessState::Alive => "alive",
            LivenessState::Suspect => "suspect",
            LivenessState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// One entry of a node's Cluster View.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberRecord {
    pub id: NodeId,
    /// Gossip address (`host:port`).
    pub address: String,
    /// Public key share advertised by the member (hex).
    pub public_key_share: String,
    pub state: LivenessState,
    pub incarnation: u64,
    /// Epoch millis when this node last heard from or about the member.
    pub last_seen: u64,
}

/// Snapshot of one node's local view of the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterView {
    pub local_id: NodeId,
    /// Members sorted by id, including the local node.
    pub members: Vec<MemberRecord>,
}

impl ClusterView {
    /// Ids of all members currently considered ALIVE.
    pub fn alive_ids(&self) -> BTreeSet<NodeId> {
        self.members
            .iter()
            .filter(|m| m.state == LivenessState::Alive)
            .map(|m| m.id.clone())
            .collect()
    }

    /// Look up a member by id.
    pub fn get(&self, id: &str) -> Option<&MemberRecord> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Liveness of `id`, if known.
    pub fn state_of(&self, id: &str) -> Option<LivenessState> {
        self.get(id).map(|m| m.state)
    }
}

// ── Telemetry ─────────────────────────────────────────────────────

/// An opaque ciphertext produced by the scheduling encryption backend.
///
/// Serialized as a hex string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ciphertext(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl Ciphertext {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Plaintext metrics measured by a node before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextMetrics {
    /// Replica slots this node offers.
    pub capacity: u64,
    /// Replica slots currently occupied.
    pub load: u64,
    /// Operator-assigned priority.
    pub priority: u64,
}

/// Encrypted resource telemetry published by one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub node_id: NodeId,
    pub capacity: Ciphertext,
    pub load: Ciphertext,
    pub priority: Ciphertext,
    /// Epoch millis when the metrics were measured.
    pub timestamp: u64,
    /// How long after `timestamp` the record may be used for scheduling.
    pub freshness_ms: u64,
}

impl TelemetryRecord {
    /// Whether the record is still inside its freshness window at `now`.
    pub fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp) <= self.freshness_ms
    }
}

// ── Deployment requests ───────────────────────────────────────────

/// Optional scheduling constraints attached to a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementConstraints {
    /// Upper bound on replicas of this request on any single node.
    #[serde(default)]
    pub max_per_node: Option<u32>,
    /// Nodes that must not receive a replica.
    #[serde(default)]
    pub exclude: Vec<NodeId>,
}

/// Image submission as posted to the ledger's `addImage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSpec {
    pub name: String,
    pub replicas: u32,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    /// The failed replica this submission replaces.
    #[serde(default)]
    pub reschedule_of: Option<ReplicaSlot>,
}

/// One replica of an anchored assignment. `index` counts within the node's
/// share of the request, so `(request_id, index)` alone is only unique on
/// `node_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaSlot {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub index: u32,
}

impl ReplicaSlot {
    /// Key of the container record for this slot on `node_id`.
    pub fn container_key(&self) -> String {
        ContainerRecord::make_key(&self.request_id, self.index)
    }
}

impl fmt::Display for ReplicaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.container_key(), self.node_id)
    }
}

/// Where a deployment request came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestOrigin {
    Operator,
    Reschedule { replaces: ReplicaSlot },
}

/// A request to run `replicas` copies of `image` somewhere in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRequest {
    pub id: RequestId,
    pub image: String,
    pub replicas: u32,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    pub origin: RequestOrigin,
    /// Epoch millis when the ledger recorded the request.
    pub created_at: u64,
}

/// Hex-encoded SHA-256 commitment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitmentHash(pub String);

impl fmt::Display for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A plaintext placement decision for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentAssignment {
    pub request_id: RequestId,
    pub image: String,
    /// Node id → replica count. Only nodes with at least one replica appear.
    pub placements: BTreeMap<NodeId, u32>,
    pub commitment: CommitmentHash,
}

impl DeploymentAssignment {
    pub fn total_replicas(&self) -> u32 {
        self.placements.values().sum()
    }

    /// Replicas placed on `node_id`.
    pub fn replicas_for(&self, node_id: &str) -> u32 {
        self.placements.get(node_id).copied().unwrap_or(0)
    }
}

/// Terminal result of scheduling a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Assigned(DeploymentAssignment),
    Unsatisfiable {
        request_id: RequestId,
        image: String,
        reason: String,
    },
}

impl AssignmentOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            AssignmentOutcome::Assigned(a) => &a.request_id,
            AssignmentOutcome::Unsatisfiable { request_id, .. } => request_id,
        }
    }

    pub fn image(&self) -> &str {
        match self {
            AssignmentOutcome::Assigned(a) => &a.image,
            AssignmentOutcome::Unsatisfiable { image, .. } => image,
        }
    }

    pub fn assignment(&self) -> Option<&DeploymentAssignment> {
        match self {
            AssignmentOutcome::Assigned(a) => Some(a),
            AssignmentOutcome::Unsatisfiable { .. } => None,
        }
    }
}

/// A request together with its anchored outcome, as tracked locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRecord {
    pub request: DeploymentRequest,
    pub outcome: Option<AssignmentOutcome>,
    pub commitment: Option<CommitmentHash>,
    /// Ledger sequence of the `ImageAdded` event.
    #[serde(default)]
    pub added_seq: u64,
}

impl RequestRecord {
    /// Every replica slot of the anchored assignment, in node-id then index
    /// order. Empty until an `Assigned` outcome is recorded.
    pub fn slots(&self) -> Vec<ReplicaSlot> {
        let Some(AssignmentOutcome::Assigned(assignment)) = &self.outcome else {
            return Vec::new();
        };
        assignment
            .placements
            .iter()
            .flat_map(|(node_id, count)| {
                (0..*count).map(move |index| ReplicaSlot {
                    request_id: assignment.request_id.clone(),
                    node_id: node_id.clone(),
                    index,
                })
            })
            .collect()
    }
}

/// Replica target for an image, set by `ImageScaled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleTarget {
    pub replicas: u32,
    /// Ledger sequence of the `ImageScaled` event.
    pub seq: u64,
}

/// Per-image scaling bookkeeping, rebuilt identically on every node from
/// the ledger event log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageScale {
    /// Requests added at or below this sequence predate the last removal.
    pub removed_seq: u64,
    pub target: Option<ScaleTarget>,
}

// ── Ledger ────────────────────────────────────────────────────────

/// What an anchor commitment covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum AnchorSubject {
    Outcome(AssignmentOutcome),
    Status {
        node_id: NodeId,
        containers: BTreeMap<String, ContainerState>,
    },
}

/// A hash of a decision or state delta posted to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorCommitment {
    pub hash: CommitmentHash,
    pub subject: AnchorSubject,
}

/// A single entry in the ledger's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEvent {
    pub seq: u64,
    pub kind: LedgerEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEventKind {
    ImageAdded {
        request: DeploymentRequest,
    },
    ImageRemoved {
        image: String,
    },
    /// Desired total replica count of an image; surplus replicas stop.
    ImageScaled {
        image: String,
        replicas: u32,
    },
    ImageDeployment {
        request_id: RequestId,
        commitment: CommitmentHash,
        outcome: AssignmentOutcome,
    },
    StatusAnchored {
        node_id: NodeId,
        commitment: CommitmentHash,
    },
}

/// A node registration stored by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredNode {
    pub node_id: NodeId,
    pub encrypted_capacity: Ciphertext,
    pub registered_at: u64,
}

/// Cluster-wide policy published by the ledger as opaque bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterPolicy {
    /// Applied to requests that carry no `max_per_node` of their own.
    #[serde(default)]
    pub default_max_per_node: Option<u32>,
    /// Overrides the locally configured telemetry freshness window.
    #[serde(default)]
    pub telemetry_freshness_ms: Option<u64>,
}

impl ClusterPolicy {
    /// Decode the ledger's policy payload. Empty bytes mean the default policy.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes)
    }
}

// ── Containers ────────────────────────────────────────────────────

/// Lifecycle state of a single container replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Requested,
    Pulling,
    Running,
    Healthy,
    Failed,
    Stopped,
}

impl ContainerState {
    /// Whether the replica occupies a slot on its node.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ContainerState::Requested
                | ContainerState::Pulling
                | ContainerState::Running
                | ContainerState::Healthy
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Requested => "requested",
            ContainerState::Pulling => "pulling",
            ContainerState::Running => "running",
            ContainerState::Healthy => "healthy",
            ContainerState::Failed => "failed",
            ContainerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Persisted state of one container replica on this node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRecord {
    /// `{request_id}/{index}`.
    pub key: String,
    pub request_id: RequestId,
    pub image: String,
    pub state: ContainerState,
    /// Runtime handle once started.
    pub handle: Option<String>,
    pub host_port: Option<u16>,
    /// In-place restarts performed so far.
    pub restarts: u32,
    pub last_error: Option<String>,
    pub updated_at: u64,
    /// FAILED and not yet acknowledged as resubmitted to the ledger.
    #[serde(default)]
    pub reschedule_pending: bool,
}

impl ContainerRecord {
    /// Build the `{request_id}/{index}` key.
    pub fn make_key(request_id: &str, index: u32) -> String {
        format!("{request_id}/{index}")
    }

    /// The slot this record fills on `node_id`, parsed from its key.
    pub fn slot(&self, node_id: &str) -> Option<ReplicaSlot> {
        let (_, index) = self.key.rsplit_once('/')?;
        Some(ReplicaSlot {
            request_id: self.request_id.clone(),
            node_id: node_id.to_string(),
            index: index.parse().ok()?,
        })
    }
}

// ── Gossip payloads ───────────────────────────────────────────────

/// Container status transition, gossiped opportunistically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusUpdate {
    pub node_id: NodeId,
    pub container_key: String,
    pub image: String,
    pub state: ContainerState,
    pub updated_at: u64,
}

/// Notice that an outcome for a request has been anchored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentNotice {
    pub commitment: CommitmentHash,
    pub outcome: AssignmentOutcome,
}
