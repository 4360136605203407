//! In-memory storage backend.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::core::{EntityStore, StorageResult, StoredEntity};

/// Keeps every entity in a process-local map. Used by default and in tests.
pub struct MemoryStore<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: StoredEntity> EntityStore<T> for MemoryStore<T> {
    async fn save(&self, entity: &T) -> StorageResult<()> {
        self.entries
            .write()
            .insert(entity.entity_id(), entity.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> StorageResult<Option<T>> {
        Ok(self.entries.read().get(id).cloned())
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        Ok(self.entries.write().remove(id).is_some())
    }

    async fn list(&self) -> StorageResult<Vec<T>> {
        Ok(self.entries.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl StoredEntity for Note {
        fn entity_id(&self) -> String {
            self.id.clone()
        }
    }

    #[tokio::test]
    async fn test_save_overwrites_by_id() {
        let store = MemoryStore::<Note>::new();
        let mut note = Note {
            id: "n1".to_string(),
            body: "first".to_string(),
        };
        store.save(&note).await.unwrap();
        note.body = "second".to_string();
        store.save(&note).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load("n1").await.unwrap().unwrap();
        assert_eq!(loaded.body, "second");
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let store = MemoryStore::<Note>::new();
        store
            .save(&Note {
                id: "n1".to_string(),
                body: String::new(),
            })
            .await
            .unwrap();

        assert!(store.delete("n1").await.unwrap());
        assert!(!store.delete("n1").await.unwrap());
        assert!(store.load("n1").await.unwrap().is_none());
    }
}
