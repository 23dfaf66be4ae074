//! In-process cluster bootstrap.
//!
//! Starts `cluster_size` context managers on one [`LocalBus`], replays their
//! persisted state and spawns their background tasks.

use std::sync::Arc;

use anyhow::Context as _;
use context_mesh::{
    create_persistence, ContextManager, LocalBus, MetricsSnapshot, NodeId, PersistenceConfig,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::config::AppConfig;

pub struct LocalCluster {
    pub bus: Arc<LocalBus>,
    pub managers: Vec<Arc<ContextManager>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<()>,
}

impl LocalCluster {
    pub async fn launch(config: &AppConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let bus = LocalBus::new();
        let (shutdown, signal) = watch::channel(());
        let mut managers = Vec::with_capacity(config.cluster_size);
        let mut handles = Vec::new();

        for index in 0..config.cluster_size {
            let node_id = node_id_for(config, index);
            let persistence = create_persistence(&persistence_for(config, &node_id));
            let manager = ContextManager::new(
                config.mesh.clone(),
                Arc::new(bus.join(node_id.clone())),
                persistence,
            )
            .with_context(|| format!("failed to create node {}", node_id))?;

            let recovered = manager
                .recover()
                .await
                .with_context(|| format!("failed to recover node {}", node_id))?;
            handles.extend(manager.start(signal.clone())?);

            info!(node = %node_id, recovered, "Node started");
            managers.push(manager);
        }

        Ok(Self {
            bus,
            managers,
            handles,
            shutdown,
        })
    }

    /// Stop every background task and return each node's final counters
    pub async fn shutdown(self) -> Vec<(NodeId, MetricsSnapshot)> {
        let _ = self.shutdown.send(());
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.managers
            .iter()
            .map(|manager| (manager.node_id().clone(), manager.metrics()))
            .collect()
    }
}

fn node_id_for(config: &AppConfig, index: usize) -> NodeId {
    match &config.mesh.node_id {
        Some(id) if config.cluster_size == 1 => NodeId::from(id.as_str()),
        _ if config.cluster_size == 1 => NodeId::generate(),
        _ => NodeId::from(format!("node-{}", index)),
    }
}

/// File backends get one sub-directory per node so nodes never share records
fn persistence_for(config: &AppConfig, node_id: &NodeId) -> PersistenceConfig {
    match &config.mesh.persistence {
        PersistenceConfig::File { path } if config.cluster_size > 1 => PersistenceConfig::File {
            path: path.join(node_id.as_str()),
        },
        other => other.clone(),
    }
}
