//! State Management Module
//!
//! Handles process-wide replication state and cluster membership.

mod context;
mod membership;

pub use context::{NodeRole, ReplicationContext};
pub use membership::{ClusterMembership, HostRecord};
