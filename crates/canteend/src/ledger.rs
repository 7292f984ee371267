//! Ledger mode: the development ledger server.
//!
//! Serves the registry contract over HTTP from a local store so a cluster
//! can run without an external ledger.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use canteen_ledger::{StoreLedger, ledger_router};
use canteen_state::{ClusterPolicy, StateStore};
use tracing::info;

/// Open (or create) the ledger store under `data_dir` and apply the policy
/// file if one is given.
pub fn open_ledger(data_dir: &Path, policy: Option<&Path>) -> anyhow::Result<StoreLedger> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let db_path = data_dir.join("ledger.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "ledger store opened");

    let ledger = StoreLedger::new(store);
    if let Some(path) = policy {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading policy {}", path.display()))?;
        let parsed = ClusterPolicy::from_bytes(&bytes)
            .with_context(|| format!("parsing policy {}", path.display()))?;
        ledger.set_policy(&bytes)?;
        info!(
            default_max_per_node = ?parsed.default_max_per_node,
            telemetry_freshness_ms = ?parsed.telemetry_freshness_ms,
            "cluster policy set"
        );
    }
    Ok(ledger)
}

/// `canteend ledger`: serve until Ctrl-C.
pub async fn run_ledger(port: u16, data_dir: PathBuf, policy: Option<PathBuf>) -> anyhow::Result<()> {
    let ledger = open_ledger(&data_dir, policy.as_deref())?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding ledger port {port}"))?;
    info!(%addr, "ledger server starting");

    axum::serve(listener, ledger_router(ledger))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    info!("ledger server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canteen_ledger::LedgerClient;

    #[tokio::test]
    async fn policy_file_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.json");
        std::fs::write(&policy, r#"{"default_max_per_node":2}"#).unwrap();

        let ledger = open_ledger(&dir.path().join("data"), Some(&policy)).unwrap();
        let bytes = ledger.cluster_policy().await.unwrap();
        let parsed = ClusterPolicy::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.default_max_per_node, Some(2));
    }

    #[test]
    fn malformed_policy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.json");
        std::fs::write(&policy, "not json").unwrap();
        assert!(open_ledger(dir.path(), Some(&policy)).is_err());
    }

    #[tokio::test]
    async fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = open_ledger(dir.path(), None).unwrap();
            ledger
                .add_image(canteen_state::ImageSpec {
                    name: "nginx".into(),
                    replicas: 1,
                    constraints: Default::default(),
                    reschedule_of: None,
                })
                .await
                .unwrap();
        }
        let ledger = open_ledger(dir.path(), None).unwrap();
        assert_eq!(ledger.events_since(0, 10).await.unwrap().len(), 1);
    }
}
