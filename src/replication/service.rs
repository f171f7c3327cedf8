//! Replication Service
//!
//! Inbound side of the protocol: answers the commands other nodes send.
//! Authentication and header checks happen in the transport layer before
//! a message reaches this dispatcher.

use std::sync::Arc;

use super::protocol::Message;
use super::push::PushBuffer;
use super::transport::Transport;
use crate::error::{Error, Result};
use crate::state::{ClusterMembership, HostRecord, ReplicationContext};
use crate::wal::entry::current_timestamp;
use crate::wal::TransactionLog;

/// Dispatches inbound replication commands
pub struct SyncService {
    ctx: Arc<ReplicationContext>,
    log: Arc<TransactionLog>,
    membership: Arc<ClusterMembership>,
    push_buffer: Arc<PushBuffer>,
    transport: Arc<dyn Transport>,
}

impl SyncService {
    pub fn new(
        ctx: Arc<ReplicationContext>,
        log: Arc<TransactionLog>,
        membership: Arc<ClusterMembership>,
        push_buffer: Arc<PushBuffer>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            ctx,
            log,
            membership,
            push_buffer,
            transport,
        }
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

    /// Handle one request and produce its reply
    pub async fn handle(&self, message: Message) -> Result<Message> {
        tracing::trace!("Handling {}", message.command());

        match message {
            Message::Register { url, log_position, .. } => self.handle_register(url, log_position).await,

            Message::ReadOne { id, .. } => {
                let entry = self.log.read_one(id)?;
                Ok(Message::ReadOne { id, entry })
            }

            Message::ReadLog {
                url,
                last_seen,
                limit,
                ..
            } => self.handle_read_log(url, last_seen, limit).await,

            Message::SetHosts { hosts } => {
                self.membership.set_hosts(hosts.clone()).await;
                Ok(Message::SetHosts { hosts })
            }

            Message::AddHost { host } => {
                self.require_follower("ADD_HOST")?;
                self.membership
                    .add_host(&host.url, host.log_position, host.last_seen)
                    .await;
                Ok(Message::AddHost { host })
            }

            Message::PushTransaction { source, entry, .. } => {
                self.require_follower("PUSH_TRANSACTION")?;
                let accepted = if source == self.ctx.master_address().await {
                    self.push_buffer.insert(entry.clone(), self.ctx.log_position())
                } else {
                    tracing::debug!("Ignored push of log id {} from {}, not our master", entry.id, source);
                    false
                };
                Ok(Message::PushTransaction {
                    source,
                    entry,
                    accepted,
                })
            }

            Message::Status { .. } => Ok(Message::Status {
                url: self.ctx.self_url().to_string(),
                log_position: self.ctx.log_position(),
                is_master: self.ctx.is_master(),
                master_address: self.ctx.master_address().await,
            }),
        }
    }

    async fn handle_register(&self, url: String, log_position: u64) -> Result<Message> {
        if !self.ctx.is_master() {
            return Err(Error::NotMaster(self.ctx.master_address().await));
        }

        let host = self
            .membership
            .add_host(&url, log_position, current_timestamp())
            .await;
        tracing::info!("Follower {} registered at log position {}", url, log_position);

        self.announce(host).await;

        Ok(Message::Register {
            url,
            log_position,
            hosts: self.membership.get_hosts().await,
        })
    }

    /// Tell every other follower about a newly registered host
    async fn announce(&self, host: HostRecord) {
        let targets: Vec<String> = self
            .membership
            .peers()
            .await
            .into_iter()
            .filter(|peer| *peer != host.url)
            .collect();
        if targets.is_empty() {
            return;
        }

        let transport = self.transport.clone();
        tokio::spawn(async move {
            for peer in targets {
                let mut message = Message::AddHost { host: host.clone() };
                if !transport.try_call(&peer, &mut message).await {
                    tracing::debug!("Could not announce {} to {}", host.url, peer);
                }
            }
        });
    }

    async fn handle_read_log(&self, url: String, last_seen: u64, limit: u32) -> Result<Message> {
        let chunk = self.log.read_log(last_seen, limit)?;

        if !url.is_empty() && url != self.ctx.self_url() {
            self.membership
                .add_host(&url, last_seen, current_timestamp())
                .await;

            if self.ctx.is_master() && chunk.is_current {
                self.ctx.set_follower_hint(&url).await;
            }
        }

        Ok(Message::ReadLog {
            url,
            last_seen,
            limit,
            chunk,
        })
    }

    fn require_follower(&self, command: &str) -> Result<()> {
        if self.ctx.is_master() {
            Err(Error::Protocol(format!("{} is only accepted by followers", command)))
        } else {
            Ok(())
        }
    }
}
