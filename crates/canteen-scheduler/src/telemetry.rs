//! Encrypted telemetry publishing.
//!
//! Once per interval the node measures how many replica slots it offers and
//! how many are occupied, encrypts both together with its priority under the
//! cluster scheduling key, and gossips the record. The local coordinator is
//! fed the same record directly, since gossip never echoes a node's own
//! payloads back to it.

use std::sync::Arc;
use std::time::Duration;

use canteen_cluster::{Piggyback, SwimHandle};
use canteen_enforcer::EnforcerHandle;
use canteen_placement::FheBackend;
use canteen_state::{PlaintextMetrics, TelemetryRecord, epoch_millis};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::coordinator::CoordinatorHandle;
use crate::error::SchedulerResult;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub interval: Duration,
    /// Freshness window stamped on every published record.
    pub freshness_ms: u64,
    pub memory_mb: u64,
    /// Memory reserved per replica; capacity is `memory_mb / container_memory_mb`.
    pub container_memory_mb: u64,
    pub priority: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            freshness_ms: 10_000,
            memory_mb: 4096,
            container_memory_mb: 200,
            priority: 0,
        }
    }
}

/// Replica slots offered by a node with `memory_mb` of memory.
pub fn capacity_slots(memory_mb: u64, container_memory_mb: u64) -> u64 {
    memory_mb.checked_div(container_memory_mb).unwrap_or(0)
}

/// `collectLocalMetrics`: capacity from configuration, load from the
/// number of replicas currently holding a slot.
pub fn collect_local_metrics(config: &TelemetryConfig, active: u64) -> PlaintextMetrics {
    PlaintextMetrics {
        capacity: capacity_slots(config.memory_mb, config.container_memory_mb),
        load: active,
        priority: config.priority,
    }
}

/// Encrypt `metrics` into a record stamped at `now`.
pub fn encrypt_metrics(
    fhe: &dyn FheBackend,
    node_id: &str,
    metrics: PlaintextMetrics,
    freshness_ms: u64,
    now: u64,
) -> TelemetryRecord {
    TelemetryRecord {
        node_id: node_id.to_string(),
        capacity: fhe.encrypt(metrics.capacity),
        load: fhe.encrypt(metrics.load),
        priority: fhe.encrypt(metrics.priority),
        timestamp: now,
        freshness_ms,
    }
}

pub struct TelemetryPublisher {
    pub node_id: String,
    pub config: TelemetryConfig,
    pub fhe: Arc<dyn FheBackend>,
    pub enforcer: EnforcerHandle,
    pub swim: SwimHandle,
    pub coordinator: CoordinatorHandle,
}

impl TelemetryPublisher {
    /// Measure, encrypt and publish one record.
    pub async fn publish_once(&self) -> SchedulerResult<TelemetryRecord> {
        let active = self.enforcer.active_count().await?;
        let metrics = collect_local_metrics(&self.config, active);
        let record = encrypt_metrics(
            self.fhe.as_ref(),
            &self.node_id,
            metrics,
            self.config.freshness_ms,
            epoch_millis(),
        );
        self.coordinator.observe_telemetry(record.clone()).await?;
        self.swim.publish(Piggyback::Telemetry(record.clone())).await?;
        debug!(
            node_id = %self.node_id,
            capacity = metrics.capacity,
            load = metrics.load,
            "telemetry published"
        );
        Ok(record)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if let Err(e) = self.publish_once().await {
                warn!(node_id = %self.node_id, error = %e, "telemetry publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canteen_placement::{SchedulingKey, SimulatedFhe};

    #[test]
    fn capacity_is_whole_slots() {
        assert_eq!(capacity_slots(4096, 200), 20);
        assert_eq!(capacity_slots(199, 200), 0);
        assert_eq!(capacity_slots(4096, 0), 0);
    }

    #[test]
    fn metrics_use_config_and_load() {
        let config = TelemetryConfig {
            priority: 7,
            ..TelemetryConfig::default()
        };
        let metrics = collect_local_metrics(&config, 3);
        assert_eq!(
            metrics,
            PlaintextMetrics {
                capacity: 20,
                load: 3,
                priority: 7
            }
        );
    }

    #[test]
    fn encrypted_record_opens_to_metrics() {
        let key = SchedulingKey::from_passphrase("cluster");
        let fhe = SimulatedFhe::new(key.clone());
        let metrics = PlaintextMetrics {
            capacity: 6,
            load: 2,
            priority: 1,
        };
        let record = encrypt_metrics(&fhe, "node-a", metrics, 5_000, 1_000);

        assert_eq!(record.node_id, "node-a");
        assert_eq!(key.open(&record.capacity).unwrap(), 6);
        assert_eq!(key.open(&record.load).unwrap(), 2);
        assert_eq!(key.open(&record.priority).unwrap(), 1);
        assert!(record.is_fresh(6_000));
        assert!(!record.is_fresh(6_001));
        // Fresh nonces: equal plaintexts do not produce equal ciphertexts.
        assert_ne!(record.capacity, fhe.encrypt(6));
    }
}
