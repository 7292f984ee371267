//! Ledger registration.
//!
//! A node registers its encrypted capacity with the ledger. A failed
//! registration is retried every `retry_interval` until it goes through;
//! after that the registration is refreshed every `refresh_interval`, so a
//! ledger that lost it (restart, manual cleanup) learns about the node again.

use std::sync::Arc;
use std::time::Duration;

use canteen_ledger::{LedgerResult, LedgerSync};
use canteen_placement::FheBackend;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::telemetry::{TelemetryConfig, capacity_slots};

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub retry_interval: Duration,
    pub refresh_interval: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

pub struct NodeRegistration {
    pub node_id: String,
    pub config: RegistrationConfig,
    pub telemetry: TelemetryConfig,
    pub fhe: Arc<dyn FheBackend>,
    pub sync: LedgerSync,
}

impl NodeRegistration {
    /// Register once with the configured capacity.
    pub async fn register_once(&self) -> LedgerResult<u64> {
        let capacity = capacity_slots(self.telemetry.memory_mb, self.telemetry.container_memory_mb);
        self.sync
            .register_node(&self.node_id, self.fhe.encrypt(capacity))
            .await?;
        Ok(capacity)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut registered = false;
        loop {
            match self.register_once().await {
                Ok(capacity) if !registered => {
                    info!(node_id = %self.node_id, capacity, "registered with ledger");
                    registered = true;
                }
                Ok(_) => debug!(node_id = %self.node_id, "ledger registration refreshed"),
                Err(e) if registered => {
                    warn!(node_id = %self.node_id, error = %e, "ledger registration refresh failed");
                    registered = false;
                }
                Err(e) => debug!(node_id = %self.node_id, error = %e, "ledger registration failed"),
            }
            let wait = if registered {
                self.config.refresh_interval
            } else {
                self.config.retry_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canteen_ledger::retry::fast;
    use canteen_ledger::{LedgerClient, StoreLedger, SyncConfig};
    use canteen_placement::{SchedulingKey, SimulatedFhe};
    use canteen_state::StateStore;

    fn registration(ledger: &StoreLedger, refresh_interval: Duration) -> NodeRegistration {
        NodeRegistration {
            node_id: "node-a".into(),
            config: RegistrationConfig {
                retry_interval: Duration::from_millis(10),
                refresh_interval,
            },
            telemetry: TelemetryConfig::default(),
            fhe: Arc::new(SimulatedFhe::new(SchedulingKey::from_passphrase("test"))),
            sync: LedgerSync::new(
                Arc::new(ledger.clone()),
                StateStore::open_in_memory().unwrap(),
                SyncConfig {
                    retry: fast(),
                    ..SyncConfig::default()
                },
            ),
        }
    }

    async fn registered(ledger: &StoreLedger) -> bool {
        ledger
            .members()
            .await
            .unwrap()
            .iter()
            .any(|m| m.node_id == "node-a")
    }

    async fn wait_registered(ledger: &StoreLedger) {
        for _ in 0..200 {
            if registered(ledger).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never registered");
    }

    #[tokio::test]
    async fn registration_retries_until_the_ledger_is_back() {
        let ledger = StoreLedger::new(StateStore::open_in_memory().unwrap());
        ledger.set_available(false);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(registration(&ledger, Duration::from_secs(3600)).run(shutdown));

        tokio::time::sleep(Duration::from_millis(60)).await;
        ledger.set_available(true);
        wait_registered(&ledger).await;

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn lost_registration_is_refreshed() {
        let ledger = StoreLedger::new(StateStore::open_in_memory().unwrap());
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(registration(&ledger, Duration::from_millis(30)).run(shutdown));
        wait_registered(&ledger).await;

        ledger.deregister_node("node-a").await.unwrap();
        wait_registered(&ledger).await;

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn registers_the_configured_capacity() {
        let ledger = StoreLedger::new(StateStore::open_in_memory().unwrap());
        let capacity = registration(&ledger, Duration::from_secs(60))
            .register_once()
            .await
            .unwrap();
        assert_eq!(capacity, 20);
        assert!(registered(&ledger).await);
    }
}
