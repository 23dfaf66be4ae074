//! Node configuration: YAML file plus command-line overrides.

use std::path::Path;

use context_mesh::ContextMeshConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Logging output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mesh: ContextMeshConfig,
    /// Number of in-process nodes sharing one local bus
    pub cluster_size: usize,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mesh: ContextMeshConfig::default(),
            cluster_size: 1,
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mesh.validate().map_err(ConfigError::Invalid)?;
        if self.cluster_size == 0 {
            return Err(ConfigError::Invalid(
                "cluster_size must be at least 1".to_string(),
            ));
        }
        if self.cluster_size > 1 && self.mesh.node_id.is_some() {
            return Err(ConfigError::Invalid(
                "node_id can only be pinned when cluster_size is 1".to_string(),
            ));
        }
        Ok(())
    }
}
