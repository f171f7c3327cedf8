//! Replication Module
//!
//! Log shipping between master and followers: the wire protocol, the
//! inbound service, the push accelerator and the coordinator that drives
//! catch-up, tailing and failover.

pub mod protocol;
pub mod transport;
pub mod push;
mod service;
mod coordinator;

#[cfg(test)]
pub(crate) mod loopback;

pub use coordinator::{SyncCoordinator, SyncSettings, SyncState, TailExit};
pub use protocol::{Command, Endpoint, Message};
pub use push::{PushBuffer, PushReplicator};
pub use service::SyncService;
pub use transport::Transport;
