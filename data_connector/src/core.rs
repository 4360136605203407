// core.rs
//
// Core types for the data connector module.
// Contains the storage trait, the entity bound and the error type shared by
// all backends.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// An entity that can be persisted by an [`EntityStore`].
pub trait StoredEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier used as the storage key.
    fn entity_id(&self) -> String;
}

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// CRUD interface for storage backends
#[async_trait]
pub trait EntityStore<T: StoredEntity>: Send + Sync + 'static {
    async fn save(&self, entity: &T) -> StorageResult<()>;

    async fn load(&self, id: &str) -> StorageResult<Option<T>>;

    async fn delete(&self, id: &str) -> StorageResult<bool>;

    async fn list(&self) -> StorageResult<Vec<T>>;
}
