//! Node Assembly
//!
//! Opens the store, recovers counters and wires the replication pieces
//! of one node together.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::WolfKvConfig;
use crate::error::Result;
use crate::keyspace::{ensure_fences, recover_counters};
use crate::replication::{PushBuffer, PushReplicator, SyncCoordinator, SyncService, SyncSettings, Transport};
use crate::state::{ClusterMembership, ReplicationContext};
use crate::store::KvStore;
use crate::wal::TransactionLog;

/// A fully wired replication node
pub struct WolfKvNode {
    ctx: Arc<ReplicationContext>,
    log: Arc<TransactionLog>,
    membership: Arc<ClusterMembership>,
    push_buffer: Arc<PushBuffer>,
    service: Arc<SyncService>,
    coordinator: Arc<SyncCoordinator>,
}

impl WolfKvNode {
    /// Build a node over `store`, talking to peers through `transport`
    pub async fn open(
        config: &WolfKvConfig,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        ensure_fences(store.as_ref())?;
        let counters = recover_counters(store.as_ref())?;
        let position = counters.log_position();

        let ctx = Arc::new(ReplicationContext::new(
            config.node.url.clone(),
            config.cluster.master,
            config.master_address().map(String::from),
            counters,
        ));

        let push = PushReplicator::spawn(ctx.clone(), transport.clone(), config.cluster.push_queue_size);
        let log = Arc::new(TransactionLog::new(store, ctx.clone()).with_push(push));
        let membership = Arc::new(ClusterMembership::new(config.node.url.clone(), position));
        let push_buffer = Arc::new(PushBuffer::new(config.cluster.push_queue_size));

        let service = Arc::new(SyncService::new(
            ctx.clone(),
            log.clone(),
            membership.clone(),
            push_buffer.clone(),
            transport.clone(),
        ));

        let coordinator = Arc::new(SyncCoordinator::new(
            ctx.clone(),
            log.clone(),
            membership.clone(),
            push_buffer.clone(),
            transport,
            SyncSettings::from_config(config),
        ));

        tracing::info!(
            "Node {} opened as {} at log position {}",
            ctx.self_url(),
            ctx.role(),
            position
        );

        Ok(Self {
            ctx,
            log,
            membership,
            push_buffer,
            service,
            coordinator,
        })
    }

    pub fn context(&self) -> &Arc<ReplicationContext> {
        &self.ctx
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub fn push_buffer(&self) -> &Arc<PushBuffer> {
        &self.push_buffer
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Run the coordinator lifecycle in the background
    pub fn spawn_sync(&self) -> JoinHandle<Result<()>> {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    }

    /// Cancel every loop and in-flight call of this node
    pub fn shutdown(&self) {
        tracing::info!("Shutting down node {}", self.ctx.self_url());
        self.ctx.shutdown();
    }
}
