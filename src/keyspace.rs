//! Key-Space Layout and Counter Recovery
//!
//! The store is split into partitions by a one-byte key type prefix.
//! Every key is `[type][seq: u64 BE][suffix...]`, so each partition is a
//! contiguous, sorted sub-range. A zero-sequence fence record sits at the
//! start of every partition; recovering the last sequence of a type is a
//! single backward seek from the next partition's fence.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::store::{BatchOp, KvStore};

/// Length of the `[type][seq]` key head
pub const KEY_HEAD_LEN: usize = 9;

/// Key partitions, in store order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum KeyType {
    /// Replication log entries, keyed by log id
    Log = 0x10,
    /// Diagnostic index of log entries by (timestamp, id)
    LogTime = 0x11,
    /// User profiles
    Profile = 0x30,
    /// Application records, keyed by primary counter
    Record = 0x40,
    /// Opaque application blobs
    Blob = 0x50,
    /// Terminal sentinel; holds only its fence
    End = 0xff,
}

impl KeyType {
    /// All partitions in key order
    pub const ALL: [KeyType; 6] = [
        KeyType::Log,
        KeyType::LogTime,
        KeyType::Profile,
        KeyType::Record,
        KeyType::Blob,
        KeyType::End,
    ];

    pub fn prefix(self) -> u8 {
        self as u8
    }

    pub fn from_prefix(prefix: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|kt| kt.prefix() == prefix)
    }

    /// Classify a key by its partition
    pub fn of(key: &[u8]) -> Option<Self> {
        key.first().copied().and_then(Self::from_prefix)
    }

    /// The partition that follows this one, if any
    pub fn next(self) -> Option<Self> {
        let pos = Self::ALL.iter().position(|kt| *kt == self)?;
        Self::ALL.get(pos + 1).copied()
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Log => write!(f, "LOG"),
            KeyType::LogTime => write!(f, "LOG_TIME"),
            KeyType::Profile => write!(f, "PROFILE"),
            KeyType::Record => write!(f, "RECORD"),
            KeyType::Blob => write!(f, "BLOB"),
            KeyType::End => write!(f, "END"),
        }
    }
}

/// Encode `[type][seq]`
pub fn encode_key(kt: KeyType, seq: u64) -> Vec<u8> {
    encode_key_with_suffix(kt, seq, &[])
}

/// Encode `[type][seq][suffix]`
pub fn encode_key_with_suffix(kt: KeyType, seq: u64, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_HEAD_LEN + suffix.len());
    key.push(kt.prefix());
    key.extend_from_slice(&seq.to_be_bytes());
    key.extend_from_slice(suffix);
    key
}

/// Decode the sequence number from a key head
pub fn decode_seq(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(1..KEY_HEAD_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Fence record key for a partition
pub fn fence_key(kt: KeyType) -> Vec<u8> {
    encode_key(kt, 0)
}

/// Exclusive upper bound of a partition
pub fn partition_end(kt: KeyType) -> Vec<u8> {
    match kt.next() {
        Some(next) => fence_key(next),
        None => vec![0xff; KEY_HEAD_LEN + 1],
    }
}

pub fn log_key(id: u64) -> Vec<u8> {
    encode_key(KeyType::Log, id)
}

pub fn log_time_key(timestamp: u64, id: u64) -> Vec<u8> {
    encode_key_with_suffix(KeyType::LogTime, timestamp, &id.to_be_bytes())
}

pub fn record_key(id: u64) -> Vec<u8> {
    encode_key(KeyType::Record, id)
}

/// Whether `key` may be written by a commit: a full key head inside a
/// data partition, and not that partition's fence.
pub fn is_data_key(key: &[u8]) -> bool {
    let in_data_partition = matches!(
        KeyType::of(key),
        Some(KeyType::Profile | KeyType::Record | KeyType::Blob)
    );
    let is_fence = key.len() == KEY_HEAD_LEN && decode_seq(key) == Some(0);
    in_data_partition && key.len() >= KEY_HEAD_LEN && !is_fence
}

/// Process-wide monotonic counters.
///
/// Both hold the last allocated value; allocation increments first.
#[derive(Debug, Default)]
pub struct Counters {
    primary: AtomicU64,
    log: AtomicU64,
}

impl Counters {
    pub fn new(primary: u64, log: u64) -> Self {
        Self {
            primary: AtomicU64::new(primary),
            log: AtomicU64::new(log),
        }
    }

    /// Last allocated record id
    pub fn primary(&self) -> u64 {
        self.primary.load(Ordering::SeqCst)
    }

    /// Last assigned log id (the node's replication position)
    pub fn log_position(&self) -> u64 {
        self.log.load(Ordering::SeqCst)
    }

    /// Allocate the next record id
    pub fn next_primary(&self) -> u64 {
        self.primary.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raise the record counter to at least `seq`
    pub fn observe_primary(&self, seq: u64) {
        self.primary.fetch_max(seq, Ordering::SeqCst);
    }

    /// Allocate the next log id
    pub fn next_log_id(&self) -> u64 {
        self.log.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim `id` only if it directly follows the current position.
    /// Returns the observed position on failure.
    pub fn claim_log_id(&self, id: u64) -> std::result::Result<(), u64> {
        let prev = id.saturating_sub(1);
        self.log
            .compare_exchange(prev, id, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
    }

    /// Undo a claim whose write never reached the store
    pub fn release_log_id(&self, id: u64) -> bool {
        self.log
            .compare_exchange(id, id.saturating_sub(1), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Write any missing fence records. Returns how many were written.
pub fn ensure_fences(store: &dyn KvStore) -> Result<usize> {
    let mut ops = Vec::new();
    for kt in KeyType::ALL {
        let key = fence_key(kt);
        if store.get(&key)?.is_none() {
            ops.push(BatchOp::put(key, Vec::new()));
        }
    }

    let written = ops.len();
    if written > 0 {
        store.write_batch(ops)?;
        tracing::info!("Wrote {} partition fence records", written);
    }
    Ok(written)
}

/// Last written sequence number in a partition (0 when only the fence exists)
pub fn last_seq(store: &dyn KvStore, kt: KeyType) -> Result<u64> {
    let next = kt
        .next()
        .ok_or_else(|| Error::Storage(format!("partition {} has no successor", kt)))?;

    match store.seek_prev(&fence_key(next))? {
        Some((key, _)) if KeyType::of(&key) == Some(kt) => decode_seq(&key)
            .ok_or_else(|| Error::Storage(format!("malformed {} key of {} bytes", kt, key.len()))),
        _ => Err(Error::Storage(format!("fence record for partition {} is missing", kt))),
    }
}

/// Restore both counters from the store
pub fn recover_counters(store: &dyn KvStore) -> Result<Counters> {
    let log = last_seq(store, KeyType::Log)?;
    let primary = last_seq(store, KeyType::Record)?;
    tracing::info!("Recovered counters: log_counter={}, primary_counter={}", log, primary);
    Ok(Counters::new(primary, log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_key_roundtrip_and_classification() {
        let key = log_key(42);
        assert_eq!(key.len(), KEY_HEAD_LEN);
        assert_eq!(KeyType::of(&key), Some(KeyType::Log));
        assert_eq!(decode_seq(&key), Some(42));

        let key = log_time_key(1_700_000_000_000, 7);
        assert_eq!(KeyType::of(&key), Some(KeyType::LogTime));
        assert_eq!(decode_seq(&key), Some(1_700_000_000_000));

        assert_eq!(KeyType::of(&[0x99]), None);
        assert_eq!(decode_seq(&[0x10, 1, 2]), None);
    }

    #[test]
    fn test_partitions_sort_by_sequence() {
        assert!(log_key(255) < log_key(256));
        assert!(log_key(u64::MAX) < fence_key(KeyType::LogTime));
        assert!(record_key(1) < partition_end(KeyType::Record));
    }

    #[test]
    fn test_data_keys_exclude_reserved_ranges() {
        assert!(is_data_key(&record_key(1)));
        assert!(is_data_key(&encode_key_with_suffix(KeyType::Blob, 0, b"name")));
        assert!(is_data_key(&encode_key(KeyType::Profile, 7)));

        assert!(!is_data_key(&fence_key(KeyType::Record)));
        assert!(!is_data_key(&log_key(99)));
        assert!(!is_data_key(&log_time_key(1_000, 1)));
        assert!(!is_data_key(&fence_key(KeyType::End)));
        assert!(!is_data_key(&[KeyType::Record.prefix(), 5]));
        assert!(!is_data_key(b"k"));
    }

    #[test]
    fn test_fences_written_once() {
        let store = MemoryStore::new();
        assert_eq!(ensure_fences(&store).unwrap(), KeyType::ALL.len());
        assert_eq!(ensure_fences(&store).unwrap(), 0);
    }

    #[test]
    fn test_recover_empty_store() {
        let store = MemoryStore::new();
        ensure_fences(&store).unwrap();

        let counters = recover_counters(&store).unwrap();
        assert_eq!(counters.log_position(), 0);
        assert_eq!(counters.primary(), 0);
    }

    #[test]
    fn test_recover_last_written() {
        let store = MemoryStore::new();
        ensure_fences(&store).unwrap();
        for id in [1u64, 2, 3, 300] {
            store.put(&log_key(id), b"entry").unwrap();
        }
        store.put(&log_time_key(99_999, 300), b"").unwrap();
        store.put(&record_key(17), b"rec").unwrap();
        store.put(&encode_key(KeyType::Profile, 5000), b"p").unwrap();

        let counters = recover_counters(&store).unwrap();
        assert_eq!(counters.log_position(), 300);
        assert_eq!(counters.primary(), 17);
    }

    #[test]
    fn test_recover_without_fences_fails() {
        let store = MemoryStore::new();
        assert!(matches!(recover_counters(&store), Err(Error::Storage(_))));
    }

    #[test]
    fn test_counters_allocate_and_claim() {
        let counters = Counters::new(0, 4);
        assert_eq!(counters.next_log_id(), 5);
        assert_eq!(counters.next_primary(), 1);
        counters.observe_primary(9);
        counters.observe_primary(3);
        assert_eq!(counters.next_primary(), 10);

        assert!(counters.claim_log_id(6).is_ok());
        assert_eq!(counters.claim_log_id(8), Err(6));
        assert_eq!(counters.log_position(), 6);

        assert!(counters.release_log_id(6));
        assert!(!counters.release_log_id(6));
        assert_eq!(counters.log_position(), 5);
    }
}
