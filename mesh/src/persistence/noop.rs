use async_trait::async_trait;

use super::{ContextPersistence, PersistedContext};
use crate::error::PersistenceResult;

/// Persistence disabled: saves are accepted and forgotten
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpContextPersistence;

impl NoOpContextPersistence {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContextPersistence for NoOpContextPersistence {
    async fn save(&self, _record: PersistedContext) -> PersistenceResult<()> {
        Ok(())
    }

    async fn load_all(&self) -> PersistenceResult<Vec<PersistedContext>> {
        Ok(Vec::new())
    }

    fn backend_name(&self) -> &'static str {
        "none"
    }
}
