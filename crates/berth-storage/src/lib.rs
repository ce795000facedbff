//! Berth Storage - revisioned, watchable storage on redb
//!
//! This crate provides:
//! - KVStore trait for storage abstraction
//! - redb-based implementation
//! - A revisioned store with resumable, compaction-aware watches
//! - A typed registry for `berth_core::Resource` objects

pub mod error;
pub mod kv;
pub mod redb_backend;
pub mod registry;
pub mod revision;

// Re-export commonly used types
pub use error::{Result, StorageError};
pub use kv::{KVStore, Transaction};
pub use redb_backend::RedbBackend;
pub use registry::{Registry, TypedWatcher};
pub use revision::{EventAction, RevisionedStore, StoreConfig, StoredEvent, Versioned, Watcher};
