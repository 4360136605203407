//! NoOp storage implementation
//!
//! Does nothing - useful when persistence is disabled.

use async_trait::async_trait;

use crate::core::{EntityStore, StorageResult, StoredEntity};

#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpStore;

#[async_trait]
impl<T: StoredEntity> EntityStore<T> for NoOpStore {
    async fn save(&self, _entity: &T) -> StorageResult<()> {
        Ok(())
    }

    async fn load(&self, _id: &str) -> StorageResult<Option<T>> {
        Ok(None)
    }

    async fn delete(&self, _id: &str) -> StorageResult<bool> {
        Ok(false)
    }

    async fn list(&self) -> StorageResult<Vec<T>> {
        Ok(Vec::new())
    }
}
