//! Ordered write-behind for entity snapshots.
//!
//! Registries mutate their in-memory state under a lock and must not await a
//! backend while holding it. They enqueue snapshots here instead; a single
//! background task applies them in submission order, so the store never sees
//! an older snapshot after a newer one for the same entity.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::{EntityStore, StoredEntity};

enum WriteOp<T> {
    Save(T),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

/// Handle for enqueueing writes. Cheap to clone.
pub struct StoreWriter<T: StoredEntity> {
    tx: mpsc::UnboundedSender<WriteOp<T>>,
    store: Arc<dyn EntityStore<T>>,
}

impl<T: StoredEntity> Clone for StoreWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

impl<T: StoredEntity> StoreWriter<T> {
    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn EntityStore<T>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp<T>>();
        let task_store = Arc::clone(&store);

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Save(entity) => {
                        let id = entity.entity_id();
                        if let Err(e) = task_store.save(&entity).await {
                            warn!(entity_id = %id, "Failed to persist entity: {}", e);
                        }
                    }
                    WriteOp::Delete(id) => {
                        if let Err(e) = task_store.delete(&id).await {
                            warn!(entity_id = %id, "Failed to delete entity: {}", e);
                        }
                    }
                    WriteOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Store writer stopped");
        });

        Self { tx, store }
    }

    pub fn save(&self, entity: T) {
        if self.tx.send(WriteOp::Save(entity)).is_err() {
            warn!("Store writer closed; dropping save");
        }
    }

    pub fn delete(&self, id: impl Into<String>) {
        if self.tx.send(WriteOp::Delete(id.into())).is_err() {
            warn!("Store writer closed; dropping delete");
        }
    }

    /// Wait until every write enqueued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// The backing store, for reads.
    pub fn store(&self) -> &Arc<dyn EntityStore<T>> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::memory::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: String,
        value: u32,
    }

    impl StoredEntity for Counter {
        fn entity_id(&self) -> String {
            self.id.clone()
        }
    }

    #[tokio::test]
    async fn test_writes_apply_in_order() {
        let store: Arc<dyn EntityStore<Counter>> = Arc::new(MemoryStore::<Counter>::new());
        let writer = StoreWriter::spawn(Arc::clone(&store));

        for value in 0..50 {
            writer.save(Counter {
                id: "c".to_string(),
                value,
            });
        }
        writer.flush().await;

        let loaded = store.load("c").await.unwrap().unwrap();
        assert_eq!(loaded.value, 49);
    }

    #[tokio::test]
    async fn test_delete_after_save() {
        let store: Arc<dyn EntityStore<Counter>> = Arc::new(MemoryStore::<Counter>::new());
        let writer = StoreWriter::spawn(Arc::clone(&store));

        writer.save(Counter {
            id: "c".to_string(),
            value: 1,
        });
        writer.delete("c");
        writer.flush().await;

        assert!(writer.store().load("c").await.unwrap().is_none());
    }
}
