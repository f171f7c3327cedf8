//! Log Entry Types
//!
//! Defines the replication unit written to the transaction log and
//! shipped between nodes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keyspace::KeyType;
use crate::store::BatchOp;

/// Log id - 1-based, gapless position in the transaction log
pub type LogId = u64;

/// Wall-clock milliseconds since the Unix epoch
pub fn current_timestamp() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// One physical store operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationItem {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub is_delete: bool,
}

impl MutationItem {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_delete: false,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            is_delete: true,
        }
    }

    /// Partition this item writes into
    pub fn key_type(&self) -> Option<KeyType> {
        KeyType::of(&self.key)
    }

    pub fn to_batch_op(&self) -> BatchOp {
        if self.is_delete {
            BatchOp::delete(self.key.clone())
        } else {
            BatchOp::put(self.key.clone(), self.value.clone())
        }
    }
}

/// Replication unit: an ordered batch of mutations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Assigned at commit time
    pub id: LogId,
    /// Stamped by the master at commit time; followers keep it verbatim
    pub timestamp: u64,
    /// Who originated the change
    pub updater: String,
    pub items: Vec<MutationItem>,
}

impl LogEntry {
    /// Start an empty entry; id and timestamp are filled in by the commit
    pub fn new(updater: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp: 0,
            updater: updater.into(),
            items: Vec::new(),
        }
    }

    pub fn put(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.items.push(MutationItem::put(key, value));
        self
    }

    pub fn delete(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.items.push(MutationItem::delete(key));
        self
    }

    pub fn push(&mut self, item: MutationItem) {
        self.items.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Serialize entry to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize entry from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// On-disk framing of a log entry
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    checksum: u32,
    body: Vec<u8>,
}

/// Encode an entry for the log partition
pub fn encode_stored(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = entry.serialize()?;
    let stored = StoredEntry {
        checksum: crc32fast::hash(&body),
        body,
    };
    Ok(bincode::serialize(&stored)?)
}

/// Decode a log partition value, verifying its checksum
pub fn decode_stored(bytes: &[u8]) -> Result<LogEntry> {
    let stored: StoredEntry = bincode::deserialize(bytes)
        .map_err(|e| Error::Storage(format!("unreadable log record: {}", e)))?;

    if crc32fast::hash(&stored.body) != stored.checksum {
        return Err(Error::Storage("log record checksum mismatch".into()));
    }

    LogEntry::deserialize(&stored.body)
        .map_err(|e| Error::Storage(format!("unreadable log entry body: {}", e)))
}

/// Page of log entries returned by a READ_LOG pull
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Serving node's log position when the chunk was read
    pub currid: LogId,
    /// Serving node's clock when the chunk was read
    pub timestamp: u64,
    pub entries: Vec<LogEntry>,
    /// The chunk reaches `currid`; the reader is up to date after applying it
    pub is_current: bool,
}

impl LogChunk {
    pub fn heartbeat(currid: LogId) -> Self {
        Self {
            currid,
            timestamp: current_timestamp(),
            entries: Vec::new(),
            is_current: true,
        }
    }

    pub fn last_id(&self) -> Option<LogId> {
        self.entries.last().map(|e| e.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::record_key;

    #[test]
    fn test_builder_collects_items() {
        let entry = LogEntry::new("api")
            .put(record_key(1), b"alice".to_vec())
            .delete(record_key(2));

        assert_eq!(entry.items.len(), 2);
        assert!(!entry.items[0].is_delete);
        assert!(entry.items[1].is_delete);
        assert_eq!(entry.items[1].key_type(), Some(KeyType::Record));
        assert_eq!(entry.items[1].to_batch_op(), BatchOp::delete(record_key(2)));
    }

    #[test]
    fn test_stored_checksum_detects_corruption() {
        let mut entry = LogEntry::new("api").put(b"k".to_vec(), b"v".to_vec());
        entry.id = 9;
        entry.timestamp = 1234;

        let mut bytes = encode_stored(&entry).unwrap();
        assert_eq!(decode_stored(&bytes).unwrap(), entry);

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(decode_stored(&bytes), Err(Error::Storage(_))));
    }

    #[test]
    fn test_heartbeat_chunk() {
        let chunk = LogChunk::heartbeat(12);
        assert!(chunk.is_current);
        assert!(chunk.entries.is_empty());
        assert_eq!(chunk.last_id(), None);
        assert_eq!(chunk.currid, 12);
    }
}
