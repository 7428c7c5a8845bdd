//! Durable document snapshots.
//!
//! ```text
//! ┌──────────────────┐  persist on last leave / idle  ┌───────────────┐
//! │ ConnectionRegistry│ ─────────────────────────────► │ DocumentStore │
//! │   (rooms)        │ ◄───────────────────────────── │ Memory|Rocks  │
//! └──────────────────┘  load on first join            └───────────────┘
//! ```
//!
//! The registry only sees the [`DocumentStore`] trait: it stores the
//! materialized text of a room and reads it back when the room is recreated.

pub mod rocks;

pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};

use std::collections::HashMap;
use std::sync::RwLock;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store lock poisoned")]
    Poisoned,
    /// The blocking task running a store call panicked or was cancelled.
    #[error("background task failed: {0}")]
    Background(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Where room snapshots live between sessions.
pub trait DocumentStore: Send + Sync {
    /// Store the latest text of `room_id`, replacing any older snapshot.
    fn persist(&self, room_id: &str, snapshot: &str) -> Result<(), StoreError>;

    /// Latest stored text of `room_id`, if any.
    fn load(&self, room_id: &str) -> Result<Option<String>, StoreError>;

    /// Ids of every stored room.
    fn list_rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Process-local store, mostly for tests and ephemeral servers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn persist(&self, room_id: &str, snapshot: &str) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(|_| StoreError::Poisoned)?;
        snapshots.insert(room_id.to_string(), snapshot.to_string());
        Ok(())
    }

    fn load(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.get(room_id).cloned())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::Poisoned)?;
        let mut rooms: Vec<String> = snapshots.keys().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load("r1").unwrap(), None);
        store.persist("r1", "hello").unwrap();
        store.persist("r1", "hello world").unwrap();
        store.persist("r0", "").unwrap();
        assert_eq!(store.load("r1").unwrap().as_deref(), Some("hello world"));
        assert_eq!(store.list_rooms().unwrap(), vec!["r0".to_string(), "r1".to_string()]);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Database("disk full".into());
        assert_eq!(err.to_string(), "database error: disk full");
    }
}
