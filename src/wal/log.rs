//! Transaction Log
//!
//! Every mutation is committed as one atomic store batch holding the log
//! record, its time-index record and the data mutations themselves, so
//! the log and the data partitions can never disagree after a crash.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::entry::{current_timestamp, decode_stored, encode_stored, LogChunk, LogEntry, LogId, MutationItem};
use crate::error::{Error, Result};
use crate::keyspace::{decode_seq, is_data_key, log_key, log_time_key, partition_end, KeyType, KEY_HEAD_LEN};
use crate::replication::push::PushReplicator;
use crate::state::ReplicationContext;
use crate::store::{BatchOp, KvStore};

/// Hard cap on entries per READ_LOG chunk, whatever the caller asks for
pub const MAX_READ_LOG_LIMIT: u32 = 10_000;

/// Observer notified after each mutation is durable.
///
/// Runs on both the originating master and every follower applying the
/// entry, so derived state (caches, secondary indexes) stays in step.
pub trait CommitHook: Send + Sync {
    fn on_mutation(&self, key_type: KeyType, item: &MutationItem);
}

/// The replicated transaction log
pub struct TransactionLog {
    store: Arc<dyn KvStore>,
    ctx: Arc<ReplicationContext>,
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
    push: Option<PushReplicator>,
    /// Held from id allocation until the batch is durable
    commit_lock: Mutex<()>,
    /// Advisory per-class write locks
    class_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TransactionLog {
    pub fn new(store: Arc<dyn KvStore>, ctx: Arc<ReplicationContext>) -> Self {
        Self {
            store,
            ctx,
            hooks: RwLock::new(Vec::new()),
            push: None,
            commit_lock: Mutex::new(()),
            class_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Offer each master commit to the push accelerator
    pub fn with_push(mut self, push: PushReplicator) -> Self {
        self.push = Some(push);
        self
    }

    pub async fn add_hook(&self, hook: Arc<dyn CommitHook>) {
        self.hooks.write().await.push(hook);
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Commit a locally originated entry. Master only.
    ///
    /// Returns the assigned id, or `None` when the entry carried no
    /// mutations and nothing was written.
    pub async fn commit(&self, mut entry: LogEntry) -> Result<Option<LogId>> {
        if entry.is_empty() {
            tracing::trace!("Skipping empty commit from {}", entry.updater);
            return Ok(None);
        }

        if let Some(item) = entry.items.iter().find(|item| !is_data_key(&item.key)) {
            return Err(Error::Protocol(format!(
                "key {:02x?} from {} is outside the data partitions",
                item.key, entry.updater
            )));
        }

        if !self.ctx.is_master() {
            return Err(Error::NotMaster(self.ctx.master_address().await));
        }

        {
            let _guard = self.commit_lock.lock().await;
            entry.id = self.ctx.counters().next_log_id();
            entry.timestamp = current_timestamp();

            if let Err(e) = self.persist(&entry).await {
                self.ctx.counters().release_log_id(entry.id);
                tracing::error!("Commit of log id {} failed: {}", entry.id, e);
                return Err(e);
            }
        }

        tracing::debug!(
            "Committed log id {} ({} items) from {}",
            entry.id,
            entry.items.len(),
            entry.updater
        );

        if let Some(push) = &self.push {
            push.offer(&entry).await;
        }

        Ok(Some(entry.id))
    }

    /// Apply entries pulled or pushed from the master, in strict order.
    ///
    /// Ids at or below the local position are skipped. The first entry
    /// that does not directly follow the local position aborts the batch
    /// with `OutOfSequence`; everything before it stays applied.
    pub async fn apply_replicated(&self, entries: Vec<LogEntry>) -> Result<usize> {
        if self.ctx.is_master() {
            return Err(Error::Consistency(
                "a master does not apply replicated entries".into(),
            ));
        }

        let mut applied = 0;
        for entry in entries {
            if entry.id <= self.ctx.log_position() {
                tracing::trace!("Log id {} already present, skipping", entry.id);
                continue;
            }

            if let Err(position) = self.ctx.counters().claim_log_id(entry.id) {
                tracing::warn!(
                    "Out-of-sequence log id {} at local position {}; aborting batch after {} entries",
                    entry.id,
                    position,
                    applied
                );
                return Err(Error::OutOfSequence {
                    expected: position + 1,
                    got: entry.id,
                });
            }

            if let Err(e) = self.persist(&entry).await {
                self.ctx.counters().release_log_id(entry.id);
                return Err(e);
            }
            applied += 1;
        }

        if applied > 0 {
            tracing::debug!(
                "Applied {} replicated entries, position {}",
                applied,
                self.ctx.log_position()
            );
        }
        Ok(applied)
    }

    /// Write log and data as one batch, then notify hooks
    async fn persist(&self, entry: &LogEntry) -> Result<()> {
        let mut ops = commit_log_ops(entry)?;
        ops.extend(commit_data_ops(entry));
        self.store.write_batch(ops)?;

        for item in &entry.items {
            if !item.is_delete && item.key_type() == Some(KeyType::Record) {
                if let Some(seq) = decode_seq(&item.key) {
                    self.ctx.counters().observe_primary(seq);
                }
            }
        }

        let hooks = self.hooks.read().await;
        if !hooks.is_empty() {
            for item in &entry.items {
                if let Some(kt) = item.key_type() {
                    for hook in hooks.iter() {
                        hook.on_mutation(kt, item);
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch a single entry by id
    pub fn read_one(&self, id: LogId) -> Result<Option<LogEntry>> {
        match self.store.get(&log_key(id))? {
            Some(bytes) => decode_stored(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Entries after `last_seen`, up to `limit`.
    ///
    /// A caller already at the local position gets an empty heartbeat
    /// chunk; a caller claiming a position beyond it is a consistency
    /// violation. The scan stops at the first missing id.
    pub fn read_log(&self, last_seen: LogId, limit: u32) -> Result<LogChunk> {
        let current = self.ctx.log_position();

        if last_seen > current {
            return Err(Error::Consistency(format!(
                "peer has seen log id {} but local position is {}",
                last_seen, current
            )));
        }

        if last_seen == current {
            return Ok(LogChunk::heartbeat(current));
        }

        let limit = limit.clamp(1, MAX_READ_LOG_LIMIT) as usize;
        let rows = self.store.scan_from(
            &log_key(last_seen + 1),
            &partition_end(KeyType::Log),
            limit,
        )?;

        let mut entries = Vec::with_capacity(rows.len());
        let mut expected = last_seen + 1;
        for (key, value) in rows {
            if decode_seq(&key) != Some(expected) {
                tracing::debug!("Log scan stopped at gap before id {}", expected);
                break;
            }

            let entry = decode_stored(&value)?;
            if entry.id != expected {
                return Err(Error::Storage(format!(
                    "log record {} holds entry {}",
                    expected, entry.id
                )));
            }
            entries.push(entry);
            expected += 1;
        }

        Ok(LogChunk {
            currid: current,
            timestamp: current_timestamp(),
            is_current: expected > current,
            entries,
        })
    }

    /// Ids of entries stamped at or after `since`, oldest first
    pub fn ids_since(&self, since: u64, limit: usize) -> Result<Vec<LogId>> {
        let rows = self.store.scan_from(
            &log_time_key(since, 0),
            &partition_end(KeyType::LogTime),
            limit,
        )?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, _)| {
                let suffix: [u8; 8] = key.get(KEY_HEAD_LEN..KEY_HEAD_LEN + 8)?.try_into().ok()?;
                Some(u64::from_be_bytes(suffix))
            })
            .collect())
    }

    /// Take the advisory write lock for a class of operations
    pub async fn lock_class(&self, class: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.class_locks.lock().await;
            locks.entry(class.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Allocate the next application record id
    pub fn next_record_id(&self) -> u64 {
        self.ctx.counters().next_primary()
    }
}

/// Log partition writes for an entry: the record itself plus its time index
pub fn commit_log_ops(entry: &LogEntry) -> Result<Vec<BatchOp>> {
    Ok(vec![
        BatchOp::put(log_key(entry.id), encode_stored(entry)?),
        BatchOp::put(log_time_key(entry.timestamp, entry.id), Vec::new()),
    ])
}

/// Data partition writes for an entry, in item order
pub fn commit_data_ops(entry: &LogEntry) -> Vec<BatchOp> {
    entry.items.iter().map(MutationItem::to_batch_op).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::{ensure_fences, fence_key, recover_counters, record_key, Counters};
    use crate::store::MemoryStore;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn open_log(is_master: bool, position: LogId) -> (Arc<MemoryStore>, TransactionLog) {
        let store = Arc::new(MemoryStore::new());
        ensure_fences(store.as_ref()).unwrap();
        let master = if is_master { None } else { Some("http://master:7700".to_string()) };
        let ctx = Arc::new(ReplicationContext::new(
            "http://self:7700",
            is_master,
            master,
            Counters::new(0, position),
        ));
        (store.clone(), TransactionLog::new(store, ctx))
    }

    fn replicated(id: LogId) -> LogEntry {
        let mut entry = LogEntry::new("master").put(record_key(id), format!("v{}", id).into_bytes());
        entry.id = id;
        entry.timestamp = 1_000 + id;
        entry
    }

    #[tokio::test]
    async fn test_commit_assigns_ids_and_writes_data() {
        let (store, log) = open_log(true, 0);

        let id = log
            .commit(LogEntry::new("api").put(record_key(1), b"alice".to_vec()))
            .await
            .unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(store.get(&record_key(1)).unwrap(), Some(b"alice".to_vec()));

        let id = log
            .commit(LogEntry::new("api").delete(record_key(1)))
            .await
            .unwrap();
        assert_eq!(id, Some(2));
        assert_eq!(store.get(&record_key(1)).unwrap(), None);

        let stored = log.read_one(2).unwrap().unwrap();
        assert_eq!(stored.id, 2);
        assert!(stored.timestamp > 0);
        assert_eq!(stored.items, vec![MutationItem::delete(record_key(1))]);
        assert!(log.read_one(3).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_commit_is_skipped() {
        let (_store, log) = open_log(true, 0);
        assert_eq!(log.commit(LogEntry::new("api")).await.unwrap(), None);
        assert_eq!(log.ctx.log_position(), 0);
    }

    #[tokio::test]
    async fn test_reserved_keys_are_rejected() {
        let (store, log) = open_log(true, 0);

        let err = log
            .commit(LogEntry::new("api").delete(fence_key(KeyType::Record)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let err = log
            .commit(
                LogEntry::new("api")
                    .put(record_key(1), b"ok".to_vec())
                    .put(log_key(99), b"junk".to_vec()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        // Nothing written and no id consumed
        assert_eq!(log.ctx.log_position(), 0);
        assert_eq!(store.get(&record_key(1)).unwrap(), None);
        assert_eq!(store.get(&log_key(99)).unwrap(), None);
        assert!(store.get(&fence_key(KeyType::Record)).unwrap().is_some());

        assert_eq!(
            log.commit(LogEntry::new("api").put(record_key(1), b"ok".to_vec()))
                .await
                .unwrap(),
            Some(1)
        );
        let counters = recover_counters(store.as_ref()).unwrap();
        assert_eq!(counters.log_position(), 1);
        assert_eq!(counters.primary(), 1);
    }

    #[tokio::test]
    async fn test_follower_cannot_originate() {
        let (_store, log) = open_log(false, 0);
        let err = log
            .commit(LogEntry::new("api").put(record_key(1), b"v".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotMaster(addr) if addr == "http://master:7700"));
    }

    #[tokio::test]
    async fn test_concurrent_commits_are_gapless() {
        let (_store, log) = open_log(true, 0);
        let log = Arc::new(log);

        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25u64 {
                    let key = record_key(worker * 100 + i + 1);
                    log.commit(LogEntry::new("api").put(key, b"x".to_vec()))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let chunk = log.read_log(0, 500).unwrap();
        let ids: Vec<LogId> = chunk.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=200).collect::<Vec<_>>());
        assert!(chunk.is_current);
        assert_eq!(chunk.currid, 200);
    }

    #[tokio::test]
    async fn test_read_log_pages_and_heartbeat() {
        let (_store, log) = open_log(true, 0);
        for i in 0..5u64 {
            log.commit(LogEntry::new("api").put(record_key(i + 1), b"x".to_vec()))
                .await
                .unwrap();
        }

        let chunk = log.read_log(1, 2).unwrap();
        assert_eq!(chunk.entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
        assert!(!chunk.is_current);
        assert_eq!(chunk.currid, 5);

        let chunk = log.read_log(3, 100).unwrap();
        assert_eq!(chunk.last_id(), Some(5));
        assert!(chunk.is_current);

        let heartbeat = log.read_log(5, 100).unwrap();
        assert!(heartbeat.entries.is_empty());
        assert_eq!(heartbeat.currid, 5);
        assert!(heartbeat.is_current);
    }

    #[tokio::test]
    async fn test_read_log_rejects_future_position() {
        let (_store, log) = open_log(true, 0);
        log.commit(LogEntry::new("api").put(record_key(1), b"v".to_vec()))
            .await
            .unwrap();

        let err = log.read_log(10, 100).unwrap_err();
        assert!(err.is_consistency());
    }

    #[tokio::test]
    async fn test_read_log_stops_at_gap() {
        let (store, log) = open_log(false, 0);
        log.apply_replicated(vec![replicated(1), replicated(2)]).await.unwrap();
        store.delete(&log_key(2)).unwrap();

        let chunk = log.read_log(0, 100).unwrap();
        assert_eq!(chunk.last_id(), Some(1));
        assert!(!chunk.is_current);
    }

    #[tokio::test]
    async fn test_apply_out_of_order_keeps_good_prefix() {
        let (store, log) = open_log(false, 4);

        let err = log
            .apply_replicated(vec![replicated(5), replicated(7)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfSequence { expected: 6, got: 7 }));
        assert_eq!(log.ctx.log_position(), 5);
        assert_eq!(store.get(&record_key(5)).unwrap(), Some(b"v5".to_vec()));
        assert!(store.get(&record_key(7)).unwrap().is_none());
        assert!(log.read_one(7).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_skips_present_and_preserves_entries() {
        let (_store, log) = open_log(false, 0);
        let batch = vec![replicated(1), replicated(2), replicated(3)];

        assert_eq!(log.apply_replicated(batch.clone()).await.unwrap(), 3);
        assert_eq!(log.apply_replicated(batch.clone()).await.unwrap(), 0);

        for original in &batch {
            let stored = log.read_one(original.id).unwrap().unwrap();
            assert_eq!(&stored, original);
            assert_eq!(stored.serialize().unwrap(), original.serialize().unwrap());
        }
    }

    #[tokio::test]
    async fn test_master_refuses_replicated_entries() {
        let (_store, log) = open_log(true, 0);
        let err = log.apply_replicated(vec![replicated(1)]).await.unwrap_err();
        assert!(err.is_consistency());
    }

    #[tokio::test]
    async fn test_counters_recover_after_restart() {
        let (store, log) = open_log(true, 0);
        for i in 1..=3u64 {
            let id = log.next_record_id();
            assert_eq!(id, i);
            log.commit(LogEntry::new("api").put(record_key(id), b"r".to_vec()))
                .await
                .unwrap();
        }

        let counters = recover_counters(store.as_ref()).unwrap();
        assert_eq!(counters.log_position(), 3);
        assert_eq!(counters.primary(), 3);
    }

    #[tokio::test]
    async fn test_replicated_records_advance_primary_counter() {
        let (_store, log) = open_log(false, 0);
        log.apply_replicated(vec![replicated(1), replicated(2)]).await.unwrap();
        assert_eq!(log.next_record_id(), 3);
    }

    #[tokio::test]
    async fn test_time_index_lists_recent_ids() {
        let (_store, log) = open_log(false, 0);
        log.apply_replicated(vec![replicated(1), replicated(2), replicated(3)])
            .await
            .unwrap();

        assert_eq!(log.ids_since(1_002, 10).unwrap(), vec![2, 3]);
        assert_eq!(log.ids_since(0, 1).unwrap(), vec![1]);
    }

    struct Recorder(StdMutex<Vec<(KeyType, Vec<u8>)>>);

    impl CommitHook for Recorder {
        fn on_mutation(&self, key_type: KeyType, item: &MutationItem) {
            self.0.lock().unwrap().push((key_type, item.key.clone()));
        }
    }

    #[tokio::test]
    async fn test_hooks_see_every_mutation() {
        let (_store, log) = open_log(false, 0);
        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        log.add_hook(recorder.clone()).await;

        log.apply_replicated(vec![replicated(1)]).await.unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen, vec![(KeyType::Record, record_key(1))]);
    }

    #[tokio::test]
    async fn test_class_lock_is_exclusive() {
        let (_store, log) = open_log(true, 0);

        let guard = log.lock_class("profiles").await;
        let blocked = tokio::time::timeout(Duration::from_millis(20), log.lock_class("profiles")).await;
        assert!(blocked.is_err());

        let other = tokio::time::timeout(Duration::from_millis(20), log.lock_class("records")).await;
        assert!(other.is_ok());

        drop(guard);
        assert!(tokio::time::timeout(Duration::from_millis(20), log.lock_class("profiles"))
            .await
            .is_ok());
    }
}
