//! Write-Ahead Log Module
//!
//! The replicated transaction log: entry types, the commit path and the
//! ordered readers followers pull from.

pub mod entry;
mod log;

pub use entry::{current_timestamp, LogChunk, LogEntry, LogId, MutationItem};
pub use log::{commit_data_ops, commit_log_ops, CommitHook, TransactionLog, MAX_READ_LOG_LIMIT};
