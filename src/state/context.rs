//! Replication Context
//!
//! Process-wide replication state shared by the log, the inbound service
//! and the synchronization coordinator.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::keyspace::Counters;
use crate::wal::entry::LogId;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Node originates new log entries
    Master,
    /// Node replicates from the master
    Follower,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "MASTER"),
            NodeRole::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Shared replication state of this node
pub struct ReplicationContext {
    /// Advertised URL; also this node's host id
    self_url: String,
    is_master: AtomicBool,
    /// Where log pulls go; equals `self_url` on the master
    master_address: RwLock<String>,
    /// Follower last known to be fully caught up (push target)
    last_synced_follower: RwLock<Option<String>>,
    counters: Counters,
    shutdown: CancellationToken,
}

impl ReplicationContext {
    pub fn new(
        self_url: impl Into<String>,
        is_master: bool,
        master_address: Option<String>,
        counters: Counters,
    ) -> Self {
        let self_url = self_url.into();
        let master_address = match (is_master, master_address) {
            (true, _) | (false, None) => self_url.clone(),
            (false, Some(addr)) => addr,
        };

        Self {
            self_url,
            is_master: AtomicBool::new(is_master),
            master_address: RwLock::new(master_address),
            last_synced_follower: RwLock::new(None),
            counters,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> NodeRole {
        if self.is_master() {
            NodeRole::Master
        } else {
            NodeRole::Follower
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Last log id present on this node
    pub fn log_position(&self) -> LogId {
        self.counters.log_position()
    }

    pub async fn master_address(&self) -> String {
        self.master_address.read().await.clone()
    }

    /// Take over as master
    pub async fn promote(&self) {
        *self.master_address.write().await = self.self_url.clone();
        *self.last_synced_follower.write().await = None;
        self.is_master.store(true, Ordering::SeqCst);
        tracing::info!(
            "Node {} promoted to master at log position {}",
            self.self_url,
            self.log_position()
        );
    }

    /// Follow a (possibly new) master
    pub async fn follow(&self, master: impl Into<String>) {
        let master = master.into();
        self.is_master.store(false, Ordering::SeqCst);
        *self.last_synced_follower.write().await = None;
        tracing::info!("Node {} now follows {}", self.self_url, master);
        *self.master_address.write().await = master;
    }

    pub async fn follower_hint(&self) -> Option<String> {
        self.last_synced_follower.read().await.clone()
    }

    pub async fn set_follower_hint(&self, url: &str) {
        let mut hint = self.last_synced_follower.write().await;
        if hint.as_deref() != Some(url) {
            tracing::debug!("Push target is now {}", url);
            *hint = Some(url.to_string());
        }
    }

    /// Clear the push target, but only if it still names `url`
    pub async fn clear_follower_hint_if(&self, url: &str) -> bool {
        let mut hint = self.last_synced_follower.write().await;
        if hint.as_deref() == Some(url) {
            *hint = None;
            true
        } else {
            false
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_master_points_at_itself() {
        let ctx = ReplicationContext::new(
            "http://a:7700",
            true,
            Some("http://ignored:7700".into()),
            Counters::default(),
        );
        assert_eq!(ctx.role(), NodeRole::Master);
        assert_eq!(ctx.master_address().await, "http://a:7700");
    }

    #[tokio::test]
    async fn test_promote_and_follow() {
        let ctx = ReplicationContext::new(
            "http://b:7700",
            false,
            Some("http://a:7700".into()),
            Counters::new(0, 12),
        );
        assert!(!ctx.is_master());
        assert_eq!(ctx.master_address().await, "http://a:7700");

        ctx.promote().await;
        assert!(ctx.is_master());
        assert_eq!(ctx.master_address().await, "http://b:7700");

        ctx.follow("http://c:7700").await;
        assert_eq!(ctx.role(), NodeRole::Follower);
        assert_eq!(ctx.master_address().await, "http://c:7700");
    }

    #[tokio::test]
    async fn test_hint_cleared_only_by_its_owner() {
        let ctx = ReplicationContext::new("http://a:7700", true, None, Counters::default());
        ctx.set_follower_hint("http://b:7700").await;

        assert!(!ctx.clear_follower_hint_if("http://c:7700").await);
        assert_eq!(ctx.follower_hint().await.as_deref(), Some("http://b:7700"));

        assert!(ctx.clear_follower_hint_if("http://b:7700").await);
        assert_eq!(ctx.follower_hint().await, None);
    }

    #[test]
    fn test_shutdown_token_shared() {
        let ctx = ReplicationContext::new("http://a:7700", true, None, Counters::default());
        let token = ctx.shutdown_token();
        ctx.shutdown();
        assert!(token.is_cancelled());
        assert!(ctx.is_shutdown());
    }
}
