//! WolfKV - Replicated Ordered Key-Value Core
//!
//! The replication layer of a single-master key-value store: every
//! mutation is committed to a gapless, ordered transaction log inside the
//! same atomic batch as the data it changes, and followers pull that log
//! to stay byte-identical with the master.
//!
//! # Architecture
//!
//! One node is master and originates all log entries. Followers verify
//! their history against the master at startup, catch up in chunks, then
//! tail the log. Fresh commits are also pushed best-effort to the most
//! recently caught-up follower. When the master stops answering, followers
//! probe the cluster and elect the most advanced reachable host.
//!
//! # Features
//!
//! - Atomic log + data commits over an embedded ordered store (SQLite or memory)
//! - Counter recovery from partition fences after restart
//! - Chunked catch-up with divergence detection
//! - Failure escalation: host probing, then deterministic master election
//! - HTTP transport with shared-secret authentication and a JSON status page

pub mod config;
pub mod error;
pub mod store;
pub mod keyspace;
pub mod wal;
pub mod state;
pub mod replication;
pub mod network;
pub mod node;

pub use config::WolfKvConfig;
pub use error::{Error, Result};
pub use node::WolfKvNode;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfKvConfig;
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::keyspace::{record_key, KeyType};
    pub use crate::node::WolfKvNode;
    pub use crate::replication::{Message, SyncState, Transport};
    pub use crate::state::{ClusterMembership, HostRecord, ReplicationContext};
    pub use crate::store::{KvStore, MemoryStore, SqliteStore};
    pub use crate::wal::{CommitHook, LogEntry, MutationItem, TransactionLog};
}
