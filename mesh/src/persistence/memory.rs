use async_trait::async_trait;
use dashmap::DashMap;

use super::{ContextPersistence, PersistedContext};
use crate::error::PersistenceResult;

/// In-memory persistence, useful for tests and single-run deployments
#[derive(Debug, Default)]
pub struct MemoryContextPersistence {
    records: DashMap<String, PersistedContext>,
}

impl MemoryContextPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, context_id: &str) -> Option<PersistedContext> {
        self.records.get(context_id).map(|r| r.value().clone())
    }
}

#[async_trait]
impl ContextPersistence for MemoryContextPersistence {
    async fn save(&self, record: PersistedContext) -> PersistenceResult<()> {
        self.records.insert(record.context_id.clone(), record);
        Ok(())
    }

    async fn load_all(&self) -> PersistenceResult<Vec<PersistedContext>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
