//! Data connector module for session and tool-execution storage.
//!
//! Provides storage backends for any [`StoredEntity`]:
//! - Memory (default)
//! - None (no-op)
//!
//! Registries never talk to a backend directly on their hot path; they push
//! snapshots through a [`StoreWriter`], which applies them in order on a
//! single background task.

pub mod config;
mod core;
mod factory;
mod memory;
mod noop;
mod writer;

pub use config::StorageBackend;
pub use core::{EntityStore, StorageError, StorageResult, StoredEntity};
pub use factory::create_store;
pub use memory::MemoryStore;
pub use noop::NoOpStore;
pub use writer::StoreWriter;
