//! redb table definitions for the Canteen state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Local node metadata (`node_id`, `incarnation`, `policy`).
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Container records keyed by `{request_id}/{index}`.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Deployment requests and their anchored outcome, keyed by request id.
pub const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("requests");

/// Ledger sync bookkeeping: `cursor` and `seen:{seq}:{digest}` entries for
/// events handled beyond the cursor.
pub const SYNC: TableDefinition<&str, &[u8]> = TableDefinition::new("sync");

/// Per-image scaling bookkeeping keyed by image name.
pub const SCALES: TableDefinition<&str, &[u8]> = TableDefinition::new("scales");

/// Development ledger event log keyed by zero-padded sequence number.
pub const LEDGER_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger_events");

/// Development ledger anchors keyed by `request:{id}` or `status:{hash}`.
pub const LEDGER_ANCHORS: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger_anchors");

/// Development ledger replacement requests keyed by the replaced slot.
pub const LEDGER_RESCHEDULES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("ledger_reschedules");

/// Development ledger registered members keyed by node id.
pub const LEDGER_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger_nodes");
