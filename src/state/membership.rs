//! Cluster Membership Management
//!
//! Tracks every known host with its last reported log position and the
//! last time it was seen, and runs the master election over that table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::context::ReplicationContext;
use crate::replication::protocol::Message;
use crate::replication::transport::Transport;
use crate::wal::entry::{current_timestamp, LogId};

/// One entry of the host table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Base URL; doubles as the host id
    pub url: String,
    /// Last log id the host is known to hold
    pub log_position: LogId,
    /// Milliseconds timestamp of the last successful contact
    pub last_seen: u64,
}

impl HostRecord {
    pub fn new(url: impl Into<String>, log_position: LogId, last_seen: u64) -> Self {
        Self {
            url: url.into(),
            log_position,
            last_seen,
        }
    }

    /// Fold in newer observations. Neither field ever moves backward.
    pub fn merge(&mut self, log_position: LogId, last_seen: u64) -> bool {
        let mut changed = false;
        if log_position > self.log_position {
            self.log_position = log_position;
            changed = true;
        }
        if last_seen > self.last_seen {
            self.last_seen = last_seen;
            changed = true;
        }
        changed
    }
}

/// Cluster membership tracker
pub struct ClusterMembership {
    /// This node's URL
    self_url: String,
    /// All known hosts (including self), ordered by URL
    hosts: RwLock<BTreeMap<String, HostRecord>>,
}

impl ClusterMembership {
    /// Create a tracker that knows only this node
    pub fn new(self_url: impl Into<String>, log_position: LogId) -> Self {
        let self_url = self_url.into();
        let mut hosts = BTreeMap::new();
        hosts.insert(
            self_url.clone(),
            HostRecord::new(self_url.clone(), log_position, current_timestamp()),
        );

        Self {
            self_url,
            hosts: RwLock::new(hosts),
        }
    }

    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    /// Insert or merge a single host
    pub async fn add_host(&self, url: &str, log_position: LogId, last_seen: u64) -> HostRecord {
        let mut hosts = self.hosts.write().await;
        match hosts.get_mut(url) {
            Some(record) => {
                record.merge(log_position, last_seen);
                record.clone()
            }
            None => {
                tracing::info!("Adding host {} at log position {}", url, log_position);
                let record = HostRecord::new(url, log_position, last_seen);
                hosts.insert(url.to_string(), record.clone());
                record
            }
        }
    }

    /// Refresh this node's own record
    pub async fn touch_self(&self, log_position: LogId) {
        let url = self.self_url.clone();
        self.add_host(&url, log_position, current_timestamp()).await;
    }

    /// Replace the table with `snapshot`. Hosts present on both sides
    /// keep the newer observations; this node is always retained.
    pub async fn set_hosts(&self, snapshot: Vec<HostRecord>) {
        let mut hosts = self.hosts.write().await;
        let mut next = BTreeMap::new();

        for mut record in snapshot {
            if let Some(known) = hosts.get(&record.url) {
                record.merge(known.log_position, known.last_seen);
            }
            next.insert(record.url.clone(), record);
        }

        if let Some(own) = hosts.get(&self.self_url) {
            next.entry(self.self_url.clone())
                .and_modify(|r: &mut HostRecord| {
                    r.merge(own.log_position, own.last_seen);
                })
                .or_insert_with(|| own.clone());
        }

        tracing::debug!("Host table replaced: {} hosts", next.len());
        *hosts = next;
    }

    /// Snapshot of the table, ordered by URL
    pub async fn get_hosts(&self) -> Vec<HostRecord> {
        self.hosts.read().await.values().cloned().collect()
    }

    pub async fn get_host(&self, url: &str) -> Option<HostRecord> {
        self.hosts.read().await.get(url).cloned()
    }

    /// URLs of every host except this one
    pub async fn peers(&self) -> Vec<String> {
        self.hosts
            .read()
            .await
            .keys()
            .filter(|url| **url != self.self_url)
            .cloned()
            .collect()
    }

    /// Probe every peer with STATUS and record the reachable ones.
    /// Returns how many answered.
    pub async fn host_update(&self, transport: &dyn Transport) -> usize {
        let peers = self.peers().await;
        let probes = peers.iter().map(|url| async move {
            let mut message = Message::status();
            let ok = transport.try_call(url, &mut message).await;
            (url, ok, message)
        });
        let results = futures::future::join_all(probes).await;

        let now = current_timestamp();
        let mut reachable = 0;
        for (url, ok, message) in results {
            match (ok, message) {
                (true, Message::Status { log_position, .. }) => {
                    self.add_host(url, log_position, now).await;
                    reachable += 1;
                }
                _ => tracing::debug!("Host {} did not answer STATUS", url),
            }
        }

        tracing::info!("Host update: {}/{} peers reachable", reachable, peers.len());
        reachable
    }

    /// Pick the master among hosts seen at or after `cutoff`: highest log
    /// position first, then the lexicographically smallest URL.
    pub async fn select_master(&self, cutoff: u64) -> Option<HostRecord> {
        let hosts = self.hosts.read().await;
        hosts
            .values()
            .filter(|h| h.last_seen >= cutoff)
            .fold(None, |best: Option<&HostRecord>, host| match best {
                Some(b) if host.log_position <= b.log_position => Some(b),
                _ => Some(host),
            })
            .cloned()
    }

    /// Run the election and promote this node if it wins
    pub async fn master_update(&self, cutoff: u64, ctx: &ReplicationContext) -> Option<HostRecord> {
        let winner = self.select_master(cutoff).await;

        match &winner {
            Some(host) if host.url == self.self_url => {
                if !ctx.is_master() {
                    ctx.promote().await;
                }
            }
            Some(host) => tracing::info!(
                "Election selected {} at log position {}",
                host.url,
                host.log_position
            ),
            None => tracing::warn!("Election found no host seen since {}", cutoff),
        }

        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::keyspace::Counters;
    use async_trait::async_trait;
    use std::collections::HashMap;

    const T0: u64 = 1_700_000_000_000;

    async fn table(hosts: &[(&str, LogId, u64)]) -> ClusterMembership {
        let membership = ClusterMembership::new("http://self:7700", 0);
        let mut snapshot: Vec<HostRecord> = hosts
            .iter()
            .map(|(url, pos, seen)| HostRecord::new(*url, *pos, *seen))
            .collect();
        snapshot.push(HostRecord::new("http://self:7700", 0, 0));
        membership.set_hosts(snapshot).await;
        membership
    }

    #[test]
    fn test_merge_is_monotonic() {
        let mut record = HostRecord::new("http://a", 10, T0);
        assert!(!record.merge(5, T0 - 1));
        assert_eq!((record.log_position, record.last_seen), (10, T0));
        assert!(record.merge(12, T0));
        assert_eq!(record.log_position, 12);
    }

    #[tokio::test]
    async fn test_election_prefers_position_then_url() {
        let membership = table(&[
            ("http://a", 100, T0),
            ("http://c", 150, T0 + 5),
            ("http://b", 150, T0 + 5),
        ])
        .await;

        let winner = membership.select_master(T0).await.unwrap();
        assert_eq!(winner.url, "http://b");
        assert_eq!(winner.log_position, 150);

        // Every evaluation over the same table agrees
        for _ in 0..5 {
            assert_eq!(membership.select_master(T0).await.unwrap().url, "http://b");
        }
    }

    #[tokio::test]
    async fn test_election_ignores_stale_hosts() {
        let membership = table(&[("http://a", 500, T0 - 1), ("http://b", 20, T0 + 1)]).await;

        assert_eq!(membership.select_master(T0).await.unwrap().url, "http://b");
        assert!(membership.select_master(u64::MAX).await.is_none());
    }

    #[tokio::test]
    async fn test_set_hosts_keeps_self_and_newer_data() {
        let membership = ClusterMembership::new("http://self:7700", 7);
        membership.add_host("http://a", 40, T0).await;

        membership
            .set_hosts(vec![HostRecord::new("http://a", 30, T0 - 10), HostRecord::new("http://b", 1, T0)])
            .await;

        let hosts = membership.get_hosts().await;
        let urls: Vec<&str> = hosts.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(urls, vec!["http://a", "http://b", "http://self:7700"]);
        assert_eq!(hosts[0].log_position, 40);
        assert_eq!(hosts[0].last_seen, T0);
        assert_eq!(hosts[2].log_position, 7);
    }

    #[tokio::test]
    async fn test_master_update_promotes_self() {
        let ctx = ReplicationContext::new(
            "http://self:7700",
            false,
            Some("http://a".into()),
            Counters::new(0, 90),
        );
        let membership = table(&[("http://a", 80, T0)]).await;
        membership.touch_self(90).await;

        let winner = membership.master_update(T0, &ctx).await.unwrap();
        assert_eq!(winner.url, "http://self:7700");
        assert!(ctx.is_master());
        assert_eq!(ctx.master_address().await, "http://self:7700");
    }

    struct StatusOnly(HashMap<String, LogId>);

    #[async_trait]
    impl Transport for StatusOnly {
        async fn send(&self, peer: &str, _message: Message) -> Result<Message> {
            match self.0.get(peer) {
                Some(pos) => Ok(Message::Status {
                    url: peer.to_string(),
                    log_position: *pos,
                    is_master: false,
                    master_address: String::new(),
                }),
                None => Err(Error::transport(peer, "connection refused")),
            }
        }
    }

    #[tokio::test]
    async fn test_host_update_records_reachable_peers() {
        let membership = table(&[("http://a", 1, T0), ("http://b", 1, T0)]).await;
        let transport = StatusOnly(HashMap::from([("http://a".to_string(), 33)]));

        assert_eq!(membership.host_update(&transport).await, 1);

        let a = membership.get_host("http://a").await.unwrap();
        assert_eq!(a.log_position, 33);
        assert!(a.last_seen > T0);
        let b = membership.get_host("http://b").await.unwrap();
        assert_eq!((b.log_position, b.last_seen), (1, T0));
    }
}
