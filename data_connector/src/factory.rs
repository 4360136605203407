//! Factory for creating storage backends from configuration.

use std::sync::Arc;

use tracing::info;

use crate::{
    config::StorageBackend,
    core::{EntityStore, StoredEntity},
    memory::MemoryStore,
    noop::NoOpStore,
};

/// Create a store for `T` using the configured backend.
pub fn create_store<T: StoredEntity>(backend: StorageBackend) -> Arc<dyn EntityStore<T>> {
    info!(
        backend = %backend,
        entity = std::any::type_name::<T>(),
        "Initializing entity store"
    );
    match backend {
        StorageBackend::Memory => Arc::new(MemoryStore::<T>::new()),
        StorageBackend::None => Arc::new(NoOpStore),
    }
}
