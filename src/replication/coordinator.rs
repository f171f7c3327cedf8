//! Synchronization Coordinator
//!
//! Drives a node through its replication lifecycle: log comparison and
//! catch-up at startup, registration with the master, steady-state
//! tailing with failure escalation, and the master's host table refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::protocol::Message;
use super::push::PushBuffer;
use super::transport::Transport;
use crate::config::WolfKvConfig;
use crate::error::{Error, Result};
use crate::state::{ClusterMembership, ReplicationContext};
use crate::wal::entry::{current_timestamp, LogChunk};
use crate::wal::TransactionLog;

/// Replication phase of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Started, not yet verified against the master
    FollowerCold,
    /// Pulling history until current
    FollowerCatchup,
    /// Steady-state pulling
    FollowerTailing,
    Master,
    Stopped,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::FollowerCold => write!(f, "FOLLOWER_COLD"),
            SyncState::FollowerCatchup => write!(f, "FOLLOWER_CATCHUP"),
            SyncState::FollowerTailing => write!(f, "FOLLOWER_TAILING"),
            SyncState::Master => write!(f, "MASTER"),
            SyncState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Why the tailing loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailExit {
    /// This node won an election
    Promoted,
    Shutdown,
}

/// Timing and threshold knobs of the coordinator
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub read_log_limit: u32,
    /// Consecutive failures before probing every host (T1)
    pub host_update_threshold: u32,
    /// Consecutive failures before electing a master (T2)
    pub election_threshold: u32,
    pub busy_interval: Duration,
    pub idle_interval: Duration,
    pub host_refresh_interval: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &WolfKvConfig) -> Self {
        Self {
            read_log_limit: config.cluster.read_log_limit,
            host_update_threshold: config.cluster.host_update_threshold,
            election_threshold: config.cluster.election_threshold,
            busy_interval: config.busy_interval(),
            idle_interval: config.idle_interval(),
            host_refresh_interval: config.host_refresh_interval(),
        }
    }
}

pub struct SyncCoordinator {
    ctx: Arc<ReplicationContext>,
    log: Arc<TransactionLog>,
    membership: Arc<ClusterMembership>,
    push_buffer: Arc<PushBuffer>,
    transport: Arc<dyn Transport>,
    settings: SyncSettings,
    state: RwLock<SyncState>,
}

impl SyncCoordinator {
    pub fn new(
        ctx: Arc<ReplicationContext>,
        log: Arc<TransactionLog>,
        membership: Arc<ClusterMembership>,
        push_buffer: Arc<PushBuffer>,
        transport: Arc<dyn Transport>,
        settings: SyncSettings,
    ) -> Self {
        let state = if ctx.is_master() {
            SyncState::Master
        } else {
            SyncState::FollowerCold
        };

        Self {
            ctx,
            log,
            membership,
            push_buffer,
            transport,
            settings,
            state: RwLock::new(state),
        }
    }

    pub async fn state(&self) -> SyncState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SyncState) {
        let mut current = self.state.write().await;
        if *current != state {
            tracing::info!("Sync state {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Full lifecycle: startup sync, tailing, then master duties
    pub async fn run(&self) -> Result<()> {
        match self.init().await {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                self.set_state(SyncState::Stopped).await;
                return Ok(());
            }
            Err(e) => {
                tracing::error!("Replication startup failed: {}", e);
                self.set_state(SyncState::Stopped).await;
                return Err(e);
            }
        }

        if !self.ctx.is_master() && self.tail().await? == TailExit::Shutdown {
            self.set_state(SyncState::Stopped).await;
            return Ok(());
        }

        self.master_loop().await;
        self.set_state(SyncState::Stopped).await;
        Ok(())
    }

    /// Startup: verify history against the configured peer, catch up,
    /// locate the real master and register with it
    pub async fn init(&self) -> Result<()> {
        let position = self.ctx.log_position();
        self.membership.touch_self(position).await;

        if self.ctx.is_master() {
            tracing::info!("Starting as master at log position {}", position);
            self.set_state(SyncState::Master).await;
            return Ok(());
        }

        self.set_state(SyncState::FollowerCold).await;
        let configured = self.ctx.master_address().await;
        tracing::info!(
            "Starting as follower of {} at log position {}",
            configured,
            position
        );

        self.compare_log(&configured).await?;

        self.set_state(SyncState::FollowerCatchup).await;
        self.catch_up(&configured).await?;

        let master = self.confirm_master(&configured).await?;
        if master != configured {
            self.retarget(&master).await;
            self.compare_log(&master).await?;
        }

        self.register(&master).await?;
        self.set_state(SyncState::FollowerTailing).await;
        Ok(())
    }

    /// Check that the newest local entry exists on `peer` with the same
    /// timestamp. An empty local log always matches.
    pub async fn compare_log(&self, peer: &str) -> Result<()> {
        let id = self.ctx.log_position();
        if id == 0 {
            return Ok(());
        }

        let local = self
            .log
            .read_one(id)?
            .ok_or_else(|| Error::Storage(format!("local log entry {} is missing", id)))?;

        let Message::ReadOne { entry: remote, .. } = self.call(peer, Message::read_one(id)).await? else {
            return Err(Error::Protocol("READ_ONE answered with another message".into()));
        };

        match remote {
            Some(remote) if remote.timestamp == local.timestamp => {
                tracing::debug!("Log matches {} at id {}", peer, id);
                Ok(())
            }
            remote => {
                let remote = remote.map(|e| e.timestamp);
                tracing::error!(
                    "Local log diverges from {} at id {} (local timestamp {}, remote {:?})",
                    peer,
                    id,
                    local.timestamp,
                    remote
                );
                Err(Error::LogMismatch {
                    id,
                    local: Some(local.timestamp),
                    remote,
                })
            }
        }
    }

    /// Pull and apply chunks from `peer` until it reports us current
    pub async fn catch_up(&self, peer: &str) -> Result<()> {
        loop {
            let before = self.ctx.log_position();
            let chunk = self.pull(peer, before).await?;
            let currid = chunk.currid;
            let is_current = chunk.is_current;

            if !chunk.entries.is_empty() {
                self.log.apply_replicated(chunk.entries).await?;
            }

            let after = self.ctx.log_position();
            if is_current && after >= currid {
                tracing::info!("Caught up with {} at log position {}", peer, after);
                return Ok(());
            }

            if after == before {
                return Err(Error::Consistency(format!(
                    "no progress catching up from {} at log position {} (peer at {})",
                    peer, before, currid
                )));
            }

            tracing::info!("Catch-up from {}: {}/{}", peer, after, currid);
        }
    }

    /// Resolve the master: `peer` itself, or the one master it names.
    /// At most one redirection is followed.
    pub async fn confirm_master(&self, peer: &str) -> Result<String> {
        let (is_master, named) = self.status_of(peer).await?;
        if is_master {
            return Ok(peer.to_string());
        }

        if named.is_empty() || named == peer {
            return Err(Error::Config(format!(
                "{} is not a master and names no other master",
                peer
            )));
        }

        let (named_is_master, _) = self.status_of(&named).await?;
        if named_is_master {
            tracing::info!("{} redirected us to master {}", peer, named);
            Ok(named)
        } else {
            Err(Error::Config(format!(
                "{} names {} as master, but it is not one either",
                peer, named
            )))
        }
    }

    async fn status_of(&self, peer: &str) -> Result<(bool, String)> {
        match self.call(peer, Message::status()).await? {
            Message::Status {
                log_position,
                is_master,
                master_address,
                ..
            } => {
                self.membership
                    .add_host(peer, log_position, current_timestamp())
                    .await;
                Ok((is_master, master_address))
            }
            _ => Err(Error::Protocol("STATUS answered with another message".into())),
        }
    }

    /// Announce this node to the master and adopt its host table
    pub async fn register(&self, master: &str) -> Result<()> {
        let request = Message::register(self.ctx.self_url(), self.ctx.log_position());
        let Message::Register { hosts, .. } = self.call(master, request).await? else {
            return Err(Error::Protocol("REGISTER answered with another message".into()));
        };

        let known = hosts.len();
        self.membership.set_hosts(hosts).await;
        tracing::info!("Registered with {}; {} hosts known", master, known);
        Ok(())
    }

    /// Steady-state loop of a follower.
    ///
    /// Each pass drains pushed entries, then pulls from the master. After
    /// `host_update_threshold` consecutive failed pulls every host is
    /// probed; after `election_threshold` a master election runs using
    /// the time of the first failure as the liveness cutoff.
    pub async fn tail(&self) -> Result<TailExit> {
        self.set_state(SyncState::FollowerTailing).await;
        let shutdown = self.ctx.shutdown_token();
        let mut failures: u32 = 0;
        let mut failing_since: Option<u64> = None;

        loop {
            if shutdown.is_cancelled() {
                return Ok(TailExit::Shutdown);
            }
            if self.ctx.is_master() {
                return Ok(TailExit::Promoted);
            }

            self.drain_pushed().await?;

            let master = self.ctx.master_address().await;
            let pause = match self.pull_and_apply(&master).await {
                Ok(applied) => {
                    if failures > 0 {
                        tracing::info!("{} reachable again after {} failed pulls", master, failures);
                    }
                    failures = 0;
                    failing_since = None;
                    if applied > 0 {
                        self.settings.busy_interval
                    } else {
                        self.settings.idle_interval
                    }
                }
                Err(Error::Cancelled) => return Ok(TailExit::Shutdown),
                Err(e) if e.is_recoverable() => {
                    failures += 1;
                    let since = *failing_since.get_or_insert_with(current_timestamp);
                    tracing::warn!("Pull from {} failed ({} in a row): {}", master, failures, e);

                    if failures == self.settings.host_update_threshold {
                        self.membership.host_update(self.transport.as_ref()).await;
                    }

                    if failures >= self.settings.election_threshold {
                        failures = 0;
                        failing_since = None;

                        match self.elect(since).await {
                            Some(winner) if winner == self.ctx.self_url() => {
                                return Ok(TailExit::Promoted);
                            }
                            Some(winner) if winner != master => self.retarget(&winner).await,
                            _ => {}
                        }
                    }
                    self.settings.idle_interval
                }
                Err(e) => return Err(e),
            };

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(TailExit::Shutdown),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Apply buffered pushes that directly follow the local position
    pub async fn drain_pushed(&self) -> Result<usize> {
        let ready = self.push_buffer.drain_ready(self.ctx.log_position());
        if ready.is_empty() {
            return Ok(0);
        }

        match self.log.apply_replicated(ready).await {
            Ok(applied) => Ok(applied),
            Err(e) if e.is_consistency() => {
                tracing::warn!("Dropped pushed batch: {}", e);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn pull(&self, peer: &str, last_seen: u64) -> Result<LogChunk> {
        let request = Message::read_log(self.ctx.self_url(), last_seen, self.settings.read_log_limit);
        let Message::ReadLog { chunk, .. } = self.call(peer, request).await? else {
            return Err(Error::Protocol("READ_LOG answered with another message".into()));
        };

        self.membership
            .add_host(peer, chunk.currid, current_timestamp())
            .await;
        Ok(chunk)
    }

    /// One pull; returns how far the local position advanced
    async fn pull_and_apply(&self, master: &str) -> Result<u64> {
        let before = self.ctx.log_position();
        let chunk = self.pull(master, before).await?;

        if !chunk.entries.is_empty() {
            if let Err(e) = self.log.apply_replicated(chunk.entries).await {
                if !e.is_consistency() {
                    return Err(e);
                }
                tracing::warn!("Aborted apply batch from {}: {}", master, e);
            }
        }

        Ok(self.ctx.log_position() - before)
    }

    /// Follow `master` from now on. Pushes buffered from the previous
    /// master are dropped.
    async fn retarget(&self, master: &str) {
        self.ctx.follow(master).await;
        self.push_buffer.clear();
    }

    async fn elect(&self, cutoff: u64) -> Option<String> {
        self.membership.touch_self(self.ctx.log_position()).await;
        let winner = self.membership.master_update(cutoff, &self.ctx).await?;
        Some(winner.url)
    }

    /// Master duties: periodically push the host table to followers
    pub async fn master_loop(&self) {
        self.set_state(SyncState::Master).await;
        let shutdown = self.ctx.shutdown_token();
        let mut ticker = tokio::time::interval(self.settings.host_refresh_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh_followers().await;
                }
            }
        }
    }

    /// Send SET_HOSTS to every follower; returns how many accepted
    pub async fn refresh_followers(&self) -> usize {
        self.membership.touch_self(self.ctx.log_position()).await;
        let hosts = self.membership.get_hosts().await;
        let peers = self.membership.peers().await;

        let calls = peers.iter().map(|peer| {
            let mut message = Message::SetHosts {
                hosts: hosts.clone(),
            };
            async move {
                let ok = self.transport.try_call(peer, &mut message).await;
                (peer, ok)
            }
        });

        let mut reached = 0;
        for (peer, ok) in futures::future::join_all(calls).await {
            if ok {
                self.membership.add_host(peer, 0, current_timestamp()).await;
                reached += 1;
            }
        }

        tracing::debug!("Host table sent to {}/{} followers", reached, peers.len());
        reached
    }

    /// Outbound call that gives up when the node shuts down
    async fn call(&self, peer: &str, message: Message) -> Result<Message> {
        let shutdown = self.ctx.shutdown_token();
        tokio::select! {
            _ = shutdown.cancelled() => Err(Error::Cancelled),
            reply = self.transport.call(peer, message) => reply,
        }
    }
}
