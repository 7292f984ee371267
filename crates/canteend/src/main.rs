//! canteend — the Canteen daemon.
//!
//! One binary for every role:
//! - `node`: a cluster member (membership, scheduling, enforcement, API)
//! - `ledger`: the development ledger server
//! - `deploy` / `undeploy` / `scale` / `show`: operator commands against a node API
//!
//! # Usage
//!
//! ```text
//! canteend ledger --port 7545 --data-dir ./ledger-data
//! canteend node --config canteen.toml --p2p-port 5000 --api-port 3000
//! canteend node --p2p-port 5001 --api-port 3001 --bootstrap 127.0.0.1:5000
//! canteend deploy nginx:latest --replicas 3
//! canteend show peers
//! ```

mod client;
mod config;
mod ledger;
mod node;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{CanteenConfig, LogFormat, RuntimeKind};

#[derive(Parser)]
#[command(name = "canteend", about = "Canteen decentralized container orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fixed node id.
    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    p2p_port: Option<u16>,

    #[arg(long)]
    api_port: Option<u16>,

    /// Address peers dial for gossip (`host:port`).
    #[arg(long)]
    advertise: Option<String>,

    /// Bootstrap peer (`host:port`); repeatable.
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Node memory in MB, the basis of its replica capacity.
    #[arg(long)]
    memory_mb: Option<u64>,

    #[arg(long)]
    ledger_url: Option<String>,

    #[arg(long, value_enum)]
    runtime: Option<RuntimeKind>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a cluster node.
    Node(NodeArgs),

    /// Run the development ledger server.
    Ledger {
        #[arg(long, default_value = "7545")]
        port: u16,

        #[arg(long, default_value = "./canteen-ledger")]
        data_dir: PathBuf,

        /// JSON cluster policy to publish.
        #[arg(long)]
        policy: Option<PathBuf>,
    },

    /// Submit an image for deployment.
    Deploy {
        image: String,

        #[arg(long, default_value = "1")]
        replicas: u32,

        #[arg(long)]
        max_per_node: Option<u32>,

        /// Node API address.
        #[arg(long, default_value = "127.0.0.1:3000")]
        api: String,
    },

    /// Remove an image from the cluster.
    Undeploy {
        image: String,

        #[arg(long, default_value = "127.0.0.1:3000")]
        api: String,
    },

    /// Trim an image's replicas requested so far down to `replicas`.
    Scale {
        image: String,

        #[arg(long)]
        replicas: u32,

        #[arg(long, default_value = "127.0.0.1:3000")]
        api: String,
    },

    /// Print a node view: status, peers, cluster, containers or deployments.
    Show {
        #[arg(default_value = "status", value_parser = ["status", "peers", "cluster", "containers", "deployments", "health"])]
        view: String,

        #[arg(long, default_value = "127.0.0.1:3000")]
        api: String,
    },
}

impl NodeArgs {
    /// File and environment layers, then these flags on top.
    fn into_config(self) -> anyhow::Result<CanteenConfig> {
        let mut config = CanteenConfig::load(self.config.as_deref())?;
        if let Some(id) = self.id {
            config.node.id = Some(id);
        }
        if let Some(dir) = self.data_dir {
            config.node.data_dir = dir;
        }
        if let Some(port) = self.p2p_port {
            config.node.p2p_port = port;
        }
        if let Some(port) = self.api_port {
            config.node.api_port = port;
        }
        if let Some(addr) = self.advertise {
            config.node.advertise_address = Some(addr);
        }
        if !self.bootstrap.is_empty() {
            config.node.bootstrap = self.bootstrap;
        }
        if let Some(mb) = self.memory_mb {
            config.node.memory_mb = mb;
        }
        if let Some(url) = self.ledger_url {
            config.ledger.url = url;
        }
        if let Some(runtime) = self.runtime {
            config.enforcer.runtime = runtime;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        Ok(config)
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Node(args) => {
            let config = args.into_config()?;
            init_tracing(&config.log_level, config.log_format);
            node::run_node(config).await
        }
        Command::Ledger {
            port,
            data_dir,
            policy,
        } => {
            init_tracing("info", LogFormat::Text);
            ledger::run_ledger(port, data_dir, policy).await
        }
        Command::Deploy {
            image,
            replicas,
            max_per_node,
            api,
        } => client::deploy(&api, &image, replicas, max_per_node).await,
        Command::Undeploy { image, api } => client::undeploy(&api, &image).await,
        Command::Scale {
            image,
            replicas,
            api,
        } => client::scale(&api, &image, replicas).await,
        Command::Show { view, api } => client::show(&api, &view).await,
    }
}
