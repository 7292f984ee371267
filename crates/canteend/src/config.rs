//! canteen.toml configuration.
//!
//! Layers, later wins: built-in defaults, the TOML file, `CANTEEN_*`
//! environment variables, then command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use canteen_cluster::{MembershipConfig, SwimConfig};
use canteen_enforcer::{EnforcerConfig, SupervisorConfig, port_base};
use canteen_ledger::{RetryConfig, SyncConfig};
use canteen_scheduler::{CoordinatorConfig, RegistrationConfig, TelemetryConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// The `docker` CLI.
    Docker,
    /// In-process fake; containers are bookkeeping only.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanteenConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub node: NodeSection,
    pub gossip: GossipSection,
    pub scheduler: SchedulerSection,
    pub ledger: LedgerSection,
    pub enforcer: EnforcerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Fixed node id; generated and persisted on first start when unset.
    pub id: Option<String>,
    pub data_dir: PathBuf,
    pub p2p_port: u16,
    pub api_port: u16,
    /// Address peers dial for gossip. Defaults to `127.0.0.1:{p2p_port}`.
    pub advertise_address: Option<String>,
    pub bootstrap: Vec<String>,
    pub memory_mb: u64,
    pub container_memory_mb: u64,
    pub priority: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipSection {
    pub protocol_period_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_fanout: usize,
    pub indirect_probes: usize,
    pub suspicion_rounds: u64,
    pub retransmit_mult: u32,
    pub max_piggyback: usize,
    pub io_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub poll_interval_ms: u64,
    pub telemetry_interval_ms: u64,
    pub telemetry_freshness_ms: u64,
    pub decryption_timeout_ms: u64,
    /// Passphrase the cluster scheduling key is derived from.
    pub scheduling_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Registration is retried every poll interval until it succeeds, then
    /// refreshed at this period.
    pub registration_refresh_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcerSection {
    pub runtime: RuntimeKind,
    pub docker_bin: String,
    /// Port exposed inside containers; unset disables port mapping.
    pub container_port: Option<u16>,
    /// Optional HTTP path that must answer 2xx for a replica to be healthy.
    pub http_check_path: Option<String>,
    pub pull_retries: u32,
    pub start_retries: u32,
    pub max_restarts: u32,
    pub unhealthy_threshold: u32,
    pub health_interval_ms: u64,
    pub status_anchor_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Period of the reschedule re-send and record pruning sweep.
    pub sweep_interval_ms: u64,
    /// How long STOPPED and replaced FAILED records are kept.
    pub terminal_retention_ms: u64,
}

impl Default for CanteenConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: LogFormat::Text,
            node: NodeSection::default(),
            gossip: GossipSection::default(),
            scheduler: SchedulerSection::default(),
            ledger: LedgerSection::default(),
            enforcer: EnforcerSection::default(),
        }
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            data_dir: PathBuf::from("./canteen-data"),
            p2p_port: 5000,
            api_port: 3000,
            advertise_address: None,
            bootstrap: Vec::new(),
            memory_mb: 4096,
            container_memory_mb: 200,
            priority: 0,
        }
    }
}

impl Default for GossipSection {
    fn default() -> Self {
        let m = MembershipConfig::default();
        Self {
            protocol_period_ms: 1_000,
            probe_timeout_ms: 500,
            probe_fanout: m.probe_fanout,
            indirect_probes: m.indirect_probes,
            suspicion_rounds: m.suspicion_rounds,
            retransmit_mult: m.retransmit_mult,
            max_piggyback: m.max_piggyback,
            io_workers: 16,
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            telemetry_interval_ms: 2_000,
            telemetry_freshness_ms: 10_000,
            decryption_timeout_ms: 5_000,
            scheduling_key: "canteen-dev".into(),
        }
    }
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7545".into(),
            poll_interval_ms: 1_000,
            request_timeout_ms: 5_000,
            retry_max_attempts: 4,
            retry_initial_ms: 200,
            retry_max_ms: 5_000,
            registration_refresh_ms: 60_000,
        }
    }
}

impl Default for EnforcerSection {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Docker,
            docker_bin: "docker".into(),
            container_port: Some(80),
            http_check_path: None,
            pull_retries: 3,
            start_retries: 3,
            max_restarts: 3,
            unhealthy_threshold: 3,
            health_interval_ms: 5_000,
            status_anchor_interval_ms: 30_000,
            shutdown_grace_ms: 10_000,
            sweep_interval_ms: 5_000,
            terminal_retention_ms: 3_600_000,
        }
    }
}

// ── Loading ────────────────────────────────────────────────────

impl CanteenConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: CanteenConfig =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// File layer (when given) plus the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `CANTEEN_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("CANTEEN_LEDGER_URL") {
            self.ledger.url = v;
        }
        if let Some(v) = lookup("CANTEEN_MEMORY_MB") {
            self.node.memory_mb = parse_env("CANTEEN_MEMORY_MB", &v)?;
        }
        if let Some(v) = lookup("CANTEEN_P2P_PORT") {
            self.node.p2p_port = parse_env("CANTEEN_P2P_PORT", &v)?;
        }
        if let Some(v) = lookup("CANTEEN_API_PORT") {
            self.node.api_port = parse_env("CANTEEN_API_PORT", &v)?;
        }
        if let Some(v) = lookup("CANTEEN_POLL_INTERVAL_MS") {
            let ms = parse_env("CANTEEN_POLL_INTERVAL_MS", &v)?;
            self.scheduler.poll_interval_ms = ms;
            self.ledger.poll_interval_ms = ms;
        }
        if let Some(v) = lookup("CANTEEN_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("CANTEEN_DOCKER_BIN") {
            self.enforcer.docker_bin = v;
        }
        if let Some(v) = lookup("CANTEEN_BOOTSTRAP") {
            self.node.bootstrap = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.container_memory_mb == 0 {
            anyhow::bail!("node.container_memory_mb must be positive");
        }
        if self.gossip.protocol_period_ms == 0 || self.gossip.probe_timeout_ms == 0 {
            anyhow::bail!("gossip timings must be positive");
        }
        if self.gossip.probe_timeout_ms * 2 >= self.gossip.protocol_period_ms {
            anyhow::bail!(
                "gossip.probe_timeout_ms ({}) must be under half of protocol_period_ms ({})",
                self.gossip.probe_timeout_ms,
                self.gossip.protocol_period_ms
            );
        }
        if self.scheduler.scheduling_key.is_empty() {
            anyhow::bail!("scheduler.scheduling_key must not be empty");
        }
        Ok(())
    }

    pub fn advertise_address(&self) -> String {
        self.node
            .advertise_address
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.node.p2p_port))
    }

    // ── Per-subsystem views ────────────────────────────────────

    pub fn membership(&self) -> MembershipConfig {
        MembershipConfig {
            probe_fanout: self.gossip.probe_fanout,
            indirect_probes: self.gossip.indirect_probes,
            suspicion_rounds: self.gossip.suspicion_rounds,
            retransmit_mult: self.gossip.retransmit_mult,
            max_piggyback: self.gossip.max_piggyback,
            ..MembershipConfig::default()
        }
    }

    pub fn swim(&self) -> SwimConfig {
        SwimConfig {
            protocol_period: Duration::from_millis(self.gossip.protocol_period_ms),
            probe_timeout: Duration::from_millis(self.gossip.probe_timeout_ms),
            io_workers: self.gossip.io_workers,
        }
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(self.ledger.poll_interval_ms),
            retry: RetryConfig {
                max_attempts: self.ledger.retry_max_attempts,
                initial_delay: Duration::from_millis(self.ledger.retry_initial_ms),
                max_delay: Duration::from_millis(self.ledger.retry_max_ms),
                ..RetryConfig::default()
            },
            ..SyncConfig::default()
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            pull_retries: self.enforcer.pull_retries,
            start_retries: self.enforcer.start_retries,
            max_restarts: self.enforcer.max_restarts,
            unhealthy_threshold: self.enforcer.unhealthy_threshold,
            health_interval: Duration::from_millis(self.enforcer.health_interval_ms),
            ..SupervisorConfig::default()
        }
    }

    pub fn enforcer(&self, node_id: &str) -> EnforcerConfig {
        EnforcerConfig {
            node_id: node_id.to_string(),
            port_base: port_base(self.node.p2p_port),
            container_port: self.enforcer.container_port,
            supervisor: self.supervisor(),
            sweep_interval: Duration::from_millis(self.enforcer.sweep_interval_ms),
            terminal_retention: Duration::from_millis(self.enforcer.terminal_retention_ms),
        }
    }

    pub fn registration(&self) -> RegistrationConfig {
        RegistrationConfig {
            retry_interval: Duration::from_millis(self.ledger.poll_interval_ms),
            refresh_interval: Duration::from_millis(self.ledger.registration_refresh_ms),
        }
    }

    pub fn coordinator(&self, node_id: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: node_id.to_string(),
            decryption_timeout: Duration::from_millis(self.scheduler.decryption_timeout_ms),
            tick: Duration::from_millis(self.scheduler.poll_interval_ms.clamp(50, 1_000) / 4),
            status_retention: Duration::from_millis(self.enforcer.terminal_retention_ms),
            ..CoordinatorConfig::default()
        }
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            interval: Duration::from_millis(self.scheduler.telemetry_interval_ms),
            freshness_ms: self.scheduler.telemetry_freshness_ms,
            memory_mb: self.node.memory_mb,
            container_memory_mb: self.node.container_memory_mb,
            priority: self.node.priority,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{key}={value:?}: {e}"))
}
