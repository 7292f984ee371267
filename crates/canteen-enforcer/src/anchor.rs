//! Periodic status anchoring.
//!
//! Every interval the node's container states are digested and anchored on
//! the ledger. An unchanged digest is skipped locally; an identical digest
//! already on the ledger is a no-op there.

use std::collections::BTreeMap;
use std::time::Duration;

use canteen_ledger::LedgerSync;
use canteen_state::ContainerState;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::enforcer::EnforcerHandle;

/// Anchor one digest if it differs from `last`. Returns the digest anchored
/// (or already current) so the caller can skip it next time.
pub async fn anchor_status_once(
    enforcer: &EnforcerHandle,
    sync: &LedgerSync,
    node_id: &str,
    last: Option<&BTreeMap<String, ContainerState>>,
) -> Option<BTreeMap<String, ContainerState>> {
    let containers: BTreeMap<String, ContainerState> = match enforcer.list().await {
        Ok(records) => records.into_iter().map(|r| (r.key, r.state)).collect(),
        Err(e) => {
            debug!(error = %e, "enforcer unavailable for status digest");
            return None;
        }
    };
    if last == Some(&containers) {
        return Some(containers);
    }
    match sync.anchor_status(node_id, containers.clone()).await {
        Ok(recorded) => {
            debug!(%node_id, containers = containers.len(), recorded, "status digest anchored");
            Some(containers)
        }
        Err(e) => {
            warn!(%node_id, error = %e, "status anchor failed");
            None
        }
    }
}

pub async fn run_status_anchor(
    enforcer: EnforcerHandle,
    sync: LedgerSync,
    node_id: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        if let Some(digest) = anchor_status_once(&enforcer, &sync, &node_id, last.as_ref()).await {
            last = Some(digest);
        }
    }
}
