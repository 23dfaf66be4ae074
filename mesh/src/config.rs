//! Context mesh configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Persistence backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum PersistenceConfig {
    /// In-process map, lost on restart
    #[default]
    Memory,
    /// Persistence disabled
    None,
    /// One JSON document per context under `path`
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextMeshConfig {
    /// Fixed node identity; generated at startup when unset
    pub node_id: Option<String>,
    pub gossip_interval_ms: u64,
    /// Evict contexts that have not changed for this long. Disabled when unset.
    pub context_ttl_secs: Option<u64>,
    /// Drop tombstones every live peer has observed
    pub compaction_enabled: bool,
    /// Buffer size of the in-process notification channel
    pub notification_capacity: usize,
    pub persistence: PersistenceConfig,
}

impl Default for ContextMeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            gossip_interval_ms: default_gossip_interval_ms(),
            context_ttl_secs: None,
            compaction_enabled: true,
            notification_capacity: default_notification_capacity(),
            persistence: PersistenceConfig::default(),
        }
    }
}

fn default_gossip_interval_ms() -> u64 {
    5_000
}

fn default_notification_capacity() -> usize {
    1024
}

impl ContextMeshConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn context_ttl(&self) -> Option<Duration> {
        self.context_ttl_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.gossip_interval_ms == 0 {
            return Err("gossip_interval_ms must be greater than 0".to_string());
        }
        if self.context_ttl_secs == Some(0) {
            return Err("context_ttl_secs must be greater than 0 when set".to_string());
        }
        if self.notification_capacity == 0 {
            return Err("notification_capacity must be greater than 0".to_string());
        }
        if let Some(node_id) = &self.node_id {
            if node_id.trim().is_empty() {
                return Err("node_id should not be empty".to_string());
            }
        }
        if let PersistenceConfig::File { path } = &self.persistence {
            if path.as_os_str().is_empty() {
                return Err("file persistence requires a path".to_string());
            }
        }
        Ok(())
    }
}
