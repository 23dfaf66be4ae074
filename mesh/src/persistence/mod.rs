//! Persistence adapter for resolved contexts.
//!
//! Supported backends:
//! - Memory (default)
//! - None (no-op)
//! - File (one JSON document per context)
//!
//! Writes are queued to a background writer so a slow backend never delays a
//! merge. Failures are logged and counted only.

mod file;
mod memory;
mod noop;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub use file::FileContextPersistence;
pub use memory::MemoryContextPersistence;
pub use noop::NoOpContextPersistence;

use crate::{
    config::PersistenceConfig, error::PersistenceResult, metrics::ContextMetrics, ContextMap,
};

/// Saved snapshot of one resolved context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedContext {
    pub context_id: String,
    pub context: ContextMap,
    /// Monotonic timestamp of the save
    pub saved_at: u64,
}

/// Durable `context_id -> (context, saved_at)` store
#[async_trait]
pub trait ContextPersistence: Send + Sync + 'static {
    /// Insert or replace the record for `record.context_id`
    async fn save(&self, record: PersistedContext) -> PersistenceResult<()>;

    /// Every stored record, used once at startup
    async fn load_all(&self) -> PersistenceResult<Vec<PersistedContext>>;

    fn backend_name(&self) -> &'static str;
}

/// Build the backend selected by `config`
pub fn create_persistence(config: &PersistenceConfig) -> Arc<dyn ContextPersistence> {
    match config {
        PersistenceConfig::Memory => {
            info!("Initializing memory context persistence");
            Arc::new(MemoryContextPersistence::new())
        }
        PersistenceConfig::None => {
            info!("Context persistence disabled");
            Arc::new(NoOpContextPersistence::new())
        }
        PersistenceConfig::File { path } => {
            info!(path = %path.display(), "Initializing file context persistence");
            Arc::new(FileContextPersistence::new(path.clone()))
        }
    }
}

/// Drains queued records into the backend until shutdown.
pub(crate) async fn run_writer(
    backend: Arc<dyn ContextPersistence>,
    mut queue: mpsc::UnboundedReceiver<PersistedContext>,
    metrics: Arc<ContextMetrics>,
    mut shutdown: watch::Receiver<()>,
) {
    info!(backend = backend.backend_name(), "Persistence writer started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Flush what is already queued before stopping
                while let Ok(record) = queue.try_recv() {
                    write_one(&*backend, record, &metrics).await;
                }
                break;
            }
            record = queue.recv() => match record {
                Some(record) => write_one(&*backend, record, &metrics).await,
                None => break,
            }
        }
    }

    info!("Persistence writer stopped");
}

async fn write_one(
    backend: &dyn ContextPersistence,
    record: PersistedContext,
    metrics: &ContextMetrics,
) {
    let context_id = record.context_id.clone();
    match backend.save(record).await {
        Ok(()) => {
            debug!(context_id = %context_id, "Persisted context");
            metrics.record_persistence_write(true);
        }
        Err(e) => {
            warn!(context_id = %context_id, error = %e, "Failed to persist context");
            metrics.record_persistence_write(false);
        }
    }
}
