//! Push Accelerator
//!
//! Best-effort, single-target forwarding of fresh commits from the master
//! to the follower most recently seen fully caught up. Pushes only shorten
//! latency; the pull loop remains the source of truth, so every failure
//! here is absorbed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::protocol::Message;
use super::transport::Transport;
use crate::state::ReplicationContext;
use crate::wal::entry::{LogEntry, LogId};

/// Master side: queues commits for a detached sender task
pub struct PushReplicator {
    ctx: Arc<ReplicationContext>,
    tx: mpsc::Sender<LogEntry>,
}

impl PushReplicator {
    /// Start the sender task; it stops with the context's shutdown token
    pub fn spawn(ctx: Arc<ReplicationContext>, transport: Arc<dyn Transport>, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        tokio::spawn(run_sender(ctx.clone(), transport, rx));
        Self { ctx, tx }
    }

    /// Queue `entry` for the current push target, if there is one.
    /// Never waits: a full queue drops the push.
    pub async fn offer(&self, entry: &LogEntry) {
        if self.ctx.follower_hint().await.is_none() {
            return;
        }

        match self.tx.try_send(entry.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                tracing::debug!("Push queue full, log id {} left to the pull path", entry.id);
            }
            Err(TrySendError::Closed(entry)) => {
                tracing::debug!("Push sender stopped, log id {} left to the pull path", entry.id);
            }
        }
    }
}

async fn run_sender(
    ctx: Arc<ReplicationContext>,
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<LogEntry>,
) {
    let shutdown = ctx.shutdown_token();

    loop {
        let entry = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(entry) => entry,
                None => break,
            },
        };

        // The hint may have moved or vanished since the entry was queued
        let Some(follower) = ctx.follower_hint().await else {
            continue;
        };

        let id = entry.id;
        let delivered = match transport.call(&follower, Message::push(ctx.self_url(), entry)).await {
            Ok(Message::PushTransaction { accepted: true, .. }) => {
                tracing::trace!("Pushed log id {} to {}", id, follower);
                true
            }
            Ok(_) => {
                tracing::debug!("{} declined pushed log id {}", follower, id);
                false
            }
            Err(e) => {
                tracing::debug!("Push of log id {} to {} failed: {}", id, follower, e);
                false
            }
        };

        if !delivered && ctx.clear_follower_hint_if(&follower).await {
            tracing::info!("Stopped pushing to {}", follower);
        }
    }

    tracing::debug!("Push sender stopped");
}

/// Follower side: pushed entries waiting for the tailing loop
pub struct PushBuffer {
    entries: Mutex<BTreeMap<LogId, LogEntry>>,
    capacity: usize,
}

impl PushBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Hold a pushed entry. Entries at or below `position` and pushes
    /// arriving while the buffer is full are declined.
    pub fn insert(&self, entry: LogEntry, position: LogId) -> bool {
        if entry.id <= position {
            return false;
        }

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() >= self.capacity && !entries.contains_key(&entry.id) {
            return false;
        }
        entries.insert(entry.id, entry);
        true
    }

    /// Drop everything buffered, e.g. after switching masters
    pub fn clear(&self) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.clear();
    }

    /// Take the run of entries directly following `position`.
    /// Stale entries are discarded; anything past the first gap stays.
    pub fn drain_ready(&self, position: LogId) -> Vec<LogEntry> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let newer = entries.split_off(&(position + 1));
        *entries = newer;

        let mut ready = Vec::new();
        let mut next = position + 1;
        while let Some(entry) = entries.remove(&next) {
            ready.push(entry);
            next += 1;
        }
        ready
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
