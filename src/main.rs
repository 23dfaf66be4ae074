use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use vsm_context::{
    config::AppConfig,
    context::PersistenceConfig,
    logging::init_logging,
    node::LocalCluster,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PersistenceBackend {
    Memory,
    None,
    File,
}

#[derive(Parser, Debug)]
#[command(name = "vsm-context")]
#[command(about = "Replicated CRDT context manager for the VSM control platform", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "VSM_CONTEXT_CONFIG")]
    config: Option<PathBuf>,

    /// Fixed node identity (single-node runs only)
    #[arg(long, env = "VSM_NODE_ID")]
    node_id: Option<String>,

    /// Milliseconds between gossip rounds
    #[arg(long)]
    gossip_interval_ms: Option<u64>,

    /// Evict contexts idle for this many seconds
    #[arg(long)]
    context_ttl_secs: Option<u64>,

    #[arg(long, value_enum)]
    persistence: Option<PersistenceBackend>,

    /// Directory for the file backend
    #[arg(long, required_if_eq("persistence", "file"))]
    persistence_path: Option<PathBuf>,

    /// Number of in-process nodes on the local bus
    #[arg(long)]
    cluster_size: Option<usize>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };

        if let Some(node_id) = self.node_id {
            config.mesh.node_id = Some(node_id);
        }
        if let Some(interval) = self.gossip_interval_ms {
            config.mesh.gossip_interval_ms = interval;
        }
        if let Some(ttl) = self.context_ttl_secs {
            config.mesh.context_ttl_secs = Some(ttl);
        }
        if let Some(backend) = self.persistence {
            config.mesh.persistence = match backend {
                PersistenceBackend::Memory => PersistenceConfig::Memory,
                PersistenceBackend::None => PersistenceConfig::None,
                PersistenceBackend::File => PersistenceConfig::File {
                    path: self.persistence_path.unwrap_or_default(),
                },
            };
        }
        if let Some(size) = self.cluster_size {
            config.cluster_size = size;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if self.log_json {
            config.log.json = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;
    init_logging(&config.log)?;

    info!(
        cluster_size = config.cluster_size,
        gossip_interval_ms = config.mesh.gossip_interval_ms,
        "Starting VSM context node"
    );
    let cluster = LocalCluster::launch(&config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    for (node, metrics) in cluster.shutdown().await {
        info!(node = %node, metrics = ?metrics, "Node stopped");
    }
    Ok(())
}
