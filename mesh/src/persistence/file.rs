use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use super::{ContextPersistence, PersistedContext};
use crate::error::PersistenceResult;

/// One JSON document per context under a directory.
///
/// File names are the blake3 hash of the context id so that arbitrary ids map
/// to portable names. Writes go through a temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FileContextPersistence {
    dir: PathBuf,
}

impl FileContextPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, context_id: &str) -> PathBuf {
        let name = blake3::hash(context_id.as_bytes()).to_hex();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl ContextPersistence for FileContextPersistence {
    async fn save(&self, record: PersistedContext) -> PersistenceResult<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(&record.context_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(&record)?;

        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_all(&self) -> PersistenceResult<Vec<PersistedContext>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<PersistedContext>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable context file");
                }
            }
        }
        Ok(records)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
