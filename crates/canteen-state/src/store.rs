//! StateStore — redb-backed state persistence for a Canteen node.
//!
//! Provides typed operations over node identity, container records,
//! request outcomes, ledger sync bookkeeping, and the development ledger's
//! event log. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const META_NODE_ID: &str = "node_id";
const META_INCARNATION: &str = "incarnation";
const META_POLICY: &str = "policy";
const META_LEDGER_SEQ: &str = "ledger_seq";
const SYNC_CURSOR: &str = "cursor";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            META,
            CONTAINERS,
            REQUESTS,
            SYNC,
            LEDGER_EVENTS,
            LEDGER_ANCHORS,
            LEDGER_RESCHEDULES,
            LEDGER_NODES,
            SCALES,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Identity ───────────────────────────────────────────────────

    /// The node id persisted on first start, if any.
    pub fn local_node_id(&self) -> StateResult<Option<NodeId>> {
        self.get_json(META, META_NODE_ID)
    }

    pub fn set_local_node_id(&self, node_id: &str) -> StateResult<()> {
        self.put_json(META, META_NODE_ID, &node_id)
    }

    /// Last persisted incarnation (0 if the node never started).
    pub fn incarnation(&self) -> StateResult<u64> {
        Ok(self.get_json(META, META_INCARNATION)?.unwrap_or(0))
    }

    /// Start a new life: persist and return `stored + 1`.
    pub fn bump_incarnation(&self) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            let current: u64 = match table.get(META_INCARNATION).map_err(map_err!(Storage))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?
                }
                None => 0,
            };
            next = current + 1;
            let value = serde_json::to_vec(&next).map_err(map_err!(Codec))?;
            table
                .insert(META_INCARNATION, value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(incarnation = next, "incarnation bumped");
        Ok(next)
    }

    /// Persist `incarnation` if it is higher than the stored value.
    pub fn record_incarnation(&self, incarnation: u64) -> StateResult<()> {
        if incarnation > self.incarnation()? {
            self.put_json(META, META_INCARNATION, &incarnation)?;
        }
        Ok(())
    }

    // ── Policy ─────────────────────────────────────────────────────

    /// Raw cluster policy bytes (empty when unset).
    pub fn policy_bytes(&self) -> StateResult<Vec<u8>> {
        Ok(self.get_json(META, META_POLICY)?.unwrap_or_default())
    }

    pub fn set_policy_bytes(&self, bytes: &[u8]) -> StateResult<()> {
        self.put_json(META, META_POLICY, &bytes)
    }

    // ── Containers ─────────────────────────────────────────────────

    pub fn put_container(&self, record: &ContainerRecord) -> StateResult<()> {
        self.put_json(CONTAINERS, &record.key, record)
    }

    pub fn get_container(&self, key: &str) -> StateResult<Option<ContainerRecord>> {
        self.get_json(CONTAINERS, key)
    }

    pub fn list_containers(&self) -> StateResult<Vec<ContainerRecord>> {
        self.list_json(CONTAINERS, "")
    }

    /// Delete a container record. Returns true if it existed.
    pub fn delete_container(&self, key: &str) -> StateResult<bool> {
        self.delete_key(CONTAINERS, key)
    }

    // ── Requests ───────────────────────────────────────────────────

    pub fn put_request(&self, record: &RequestRecord) -> StateResult<()> {
        self.put_json(REQUESTS, &record.request.id, record)
    }

    pub fn get_request(&self, request_id: &str) -> StateResult<Option<RequestRecord>> {
        self.get_json(REQUESTS, request_id)
    }

    pub fn list_requests(&self) -> StateResult<Vec<RequestRecord>> {
        self.list_json(REQUESTS, "")
    }

    // ── Scaling ────────────────────────────────────────────────────

    pub fn image_scale(&self, image: &str) -> StateResult<ImageScale> {
        Ok(self.get_json(SCALES, image)?.unwrap_or_default())
    }

    pub fn put_image_scale(&self, image: &str, scale: &ImageScale) -> StateResult<()> {
        self.put_json(SCALES, image, scale)
    }

    // ── Ledger sync bookkeeping ────────────────────────────────────

    /// Sequence number up to which every ledger event has been handled
    /// (0 = none).
    pub fn sync_cursor(&self) -> StateResult<u64> {
        Ok(self.get_json(SYNC, SYNC_CURSOR)?.unwrap_or(0))
    }

    pub fn set_sync_cursor(&self, seq: u64) -> StateResult<()> {
        self.put_json(SYNC, SYNC_CURSOR, &seq)
    }

    /// Whether the event at `seq` with `digest` has been handled.
    pub fn is_seen(&self, seq: u64, digest: &str) -> StateResult<bool> {
        let key = seen_key(seq, digest);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SYNC).map_err(map_err!(Table))?;
        Ok(table.get(key.as_str()).map_err(map_err!(Storage))?.is_some())
    }

    /// Record the event at `seq` as handled. Returns false if it already was.
    pub fn mark_seen(&self, seq: u64, digest: &str) -> StateResult<bool> {
        let key = seen_key(seq, digest);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let fresh;
        {
            let mut table = txn.open_table(SYNC).map_err(map_err!(Table))?;
            fresh = table.get(key.as_str()).map_err(map_err!(Storage))?.is_none();
            if fresh {
                table
                    .insert(key.as_str(), b"true".as_slice())
                    .map_err(map_err!(Storage))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(fresh)
    }

    /// Move the cursor to `seq` and drop the seen entries it now covers.
    /// Returns how many entries were dropped.
    pub fn advance_sync_cursor(&self, seq: u64) -> StateResult<usize> {
        let upper = format!("{SEEN_PREFIX}{}", seq_key(seq.saturating_add(1)));
        let cursor = serde_json::to_vec(&seq).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let dropped;
        {
            let mut table = txn.open_table(SYNC).map_err(map_err!(Table))?;
            let mut covered = Vec::new();
            for entry in table
                .range(SEEN_PREFIX..upper.as_str())
                .map_err(map_err!(Storage))?
            {
                let (key, _) = entry.map_err(map_err!(Storage))?;
                covered.push(key.value().to_string());
            }
            for key in &covered {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
            table
                .insert(SYNC_CURSOR, cursor.as_slice())
                .map_err(map_err!(Storage))?;
            dropped = covered.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cursor = seq, dropped, "sync cursor advanced");
        Ok(dropped)
    }

    // ── Development ledger ─────────────────────────────────────────

    /// Append an event to the ledger log, assigning the next sequence number.
    pub fn append_ledger_event(&self, kind: LedgerEventKind) -> StateResult<LedgerEvent> {
        self.append_ledger_event_with(|_| kind)
    }

    /// Like [`append_ledger_event`](Self::append_ledger_event), but the event
    /// is built from the sequence number it will be stored under.
    pub fn append_ledger_event_with(
        &self,
        build: impl FnOnce(u64) -> LedgerEventKind,
    ) -> StateResult<LedgerEvent> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let event = Self::append_in(&txn, build)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq = event.seq, "ledger event appended");
        Ok(event)
    }

    /// Record `commitment` under `anchor_key` unless the key is already
    /// anchored. On success the event built by `event` is appended in the
    /// same transaction. Returns `None` when the anchor already existed.
    pub fn anchor_if_absent(
        &self,
        anchor_key: &str,
        commitment: &AnchorCommitment,
        event: LedgerEventKind,
    ) -> StateResult<Option<LedgerEvent>> {
        let value = serde_json::to_vec(commitment).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let appended;
        {
            let mut anchors = txn.open_table(LEDGER_ANCHORS).map_err(map_err!(Table))?;
            if anchors.get(anchor_key).map_err(map_err!(Storage))?.is_some() {
                appended = None;
            } else {
                anchors
                    .insert(anchor_key, value.as_slice())
                    .map_err(map_err!(Storage))?;
                appended = Some(());
            }
        }
        let event = match appended {
            Some(()) => Some(Self::append_in(&txn, |_| event)?),
            None => None,
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%anchor_key, recorded = event.is_some(), "anchor processed");
        Ok(event)
    }

    /// Append the `ImageAdded` event for the replacement of `slot` unless one
    /// was appended before. Returns the request and whether it is new.
    pub fn append_replacement_request(
        &self,
        slot: &ReplicaSlot,
        build: impl FnOnce(u64) -> DeploymentRequest,
    ) -> StateResult<(DeploymentRequest, bool)> {
        let key = slot.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existing: Option<DeploymentRequest> = {
            let table = txn.open_table(LEDGER_RESCHEDULES).map_err(map_err!(Table))?;
            match table.get(key.as_str()).map_err(map_err!(Storage))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?)
                }
                None => None,
            }
        };
        if let Some(request) = existing {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(slot = %key, request_id = %request.id, "replacement already requested");
            return Ok((request, false));
        }

        let event = Self::append_in(&txn, |seq| LedgerEventKind::ImageAdded {
            request: build(seq),
        })?;
        let LedgerEventKind::ImageAdded { request } = event.kind else {
            return Err(StateError::Codec(format!("event {} is not an image submission", event.seq)));
        };
        let value = serde_json::to_vec(&request).map_err(map_err!(Codec))?;
        {
            let mut table = txn.open_table(LEDGER_RESCHEDULES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(slot = %key, request_id = %request.id, seq = event.seq, "replacement requested");
        Ok((request, true))
    }

    pub fn get_anchor(&self, anchor_key: &str) -> StateResult<Option<AnchorCommitment>> {
        self.get_json(LEDGER_ANCHORS, anchor_key)
    }

    /// Ledger events with `seq > after`, oldest first, at most `limit`.
    pub fn ledger_events_since(&self, after: u64, limit: usize) -> StateResult<Vec<LedgerEvent>> {
        let start = seq_key(after.saturating_add(1));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEDGER_EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        if limit == 0 {
            return Ok(results);
        }
        for entry in table.range(start.as_str()..).map_err(map_err!(Storage))? {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let event: LedgerEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            results.push(event);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    pub fn put_registered_node(&self, node: &RegisteredNode) -> StateResult<()> {
        self.put_json(LEDGER_NODES, &node.node_id, node)
    }

    pub fn remove_registered_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete_key(LEDGER_NODES, node_id)
    }

    pub fn list_registered_nodes(&self) -> StateResult<Vec<RegisteredNode>> {
        self.list_json(LEDGER_NODES, "")
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn append_in(
        txn: &redb::WriteTransaction,
        build: impl FnOnce(u64) -> LedgerEventKind,
    ) -> StateResult<LedgerEvent> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let last: u64 = match meta.get(META_LEDGER_SEQ).map_err(map_err!(Storage))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?,
            None => 0,
        };
        let seq = last + 1;
        let event = LedgerEvent {
            seq,
            kind: build(seq),
        };
        let seq_value = serde_json::to_vec(&event.seq).map_err(map_err!(Codec))?;
        meta.insert(META_LEDGER_SEQ, seq_value.as_slice())
            .map_err(map_err!(Storage))?;

        let value = serde_json::to_vec(&event).map_err(map_err!(Codec))?;
        let mut events = txn.open_table(LEDGER_EVENTS).map_err(map_err!(Table))?;
        events
            .insert(seq_key(event.seq).as_str(), value.as_slice())
            .map_err(map_err!(Storage))?;
        Ok(event)
    }

    fn put_json<T: Serialize + ?Sized>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Storage))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

const SEEN_PREFIX: &str = "seen:";

/// Zero-padded key so lexical order equals numeric order.
fn seq_key(seq: u64) -> String {
    format!("{seq:020}")
}

/// Seen entries sort by sequence, so everything under the cursor is one range.
fn seen_key(seq: u64, digest: &str) -> String {
    format!("{SEEN_PREFIX}{}:{digest}", seq_key(seq))
}
