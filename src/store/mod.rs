//! Embedded Ordered Key-Value Store
//!
//! The narrow interface the replication core needs from its storage
//! engine: point reads and writes, atomic batches, and ordered seeks.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use crate::config::{StoreBackend, WolfKvConfig};
use crate::error::Result;

/// Key/value pair as returned by scans
pub type KvPair = (Vec<u8>, Vec<u8>);

/// One operation inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchOp::Delete { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Ordered key-value store.
///
/// Keys compare bytewise (lexicographically). `write_batch` is the only
/// multi-key atomicity the store offers.
pub trait KvStore: Send + Sync {
    /// Point lookup
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite a single key
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a single key (absent keys are not an error)
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply all operations atomically, in order
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Last record whose key sorts strictly before `key`
    fn seek_prev(&self, key: &[u8]) -> Result<Option<KvPair>>;

    /// Up to `limit` records with `start <= key < end`, in key order
    fn scan_from(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>>;
}

/// Open the store selected by the configuration
pub fn open_store(config: &WolfKvConfig) -> Result<Arc<dyn KvStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; data will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let path = config.store_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tracing::info!("Opening SQLite store at {:?}", path);
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
    }
}
