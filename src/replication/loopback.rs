//! In-process transport and cluster harness for multi-node tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use super::protocol::{Command, Message};
use super::service::SyncService;
use super::transport::Transport;
use crate::config::{ClusterConfig, LoggingConfig, NodeConfig, StoreBackend, StoreConfig, WolfKvConfig};
use crate::error::{Error, Result};
use crate::node::WolfKvNode;
use crate::store::MemoryStore;

/// Routes calls straight into registered services. Peers can be taken
/// down to simulate unreachable hosts.
#[derive(Default)]
pub struct LoopbackTransport {
    services: RwLock<HashMap<String, Arc<SyncService>>>,
    down: RwLock<HashSet<String>>,
    calls: Mutex<Vec<(String, Command)>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, url: &str, service: Arc<SyncService>) {
        self.services.write().unwrap().insert(url.to_string(), service);
    }

    pub fn take_down(&self, url: &str) {
        self.down.write().unwrap().insert(url.to_string());
    }

    pub fn bring_up(&self, url: &str) {
        self.down.write().unwrap().remove(url);
    }

    /// Attempted calls of `command` addressed to `peer`
    pub fn calls(&self, peer: &str, command: Command) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, c)| p == peer && *c == command)
            .count()
    }

    fn route(&self, peer: &str, command: Command) -> Result<Arc<SyncService>> {
        self.calls.lock().unwrap().push((peer.to_string(), command));

        if self.down.read().unwrap().contains(peer) {
            return Err(Error::transport(peer, "connection refused"));
        }
        self.services
            .read()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::transport(peer, "no route to host"))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, peer: &str, message: Message) -> Result<Message> {
        let service = self.route(peer, message.command())?;
        // Failures cross the wire as code + text, like the HTTP transport
        service.handle(message).await.map_err(|e| Error::Remote {
            code: e.code(),
            message: e.to_string(),
        })
    }
}

pub fn test_config(url: &str, master: Option<&str>) -> WolfKvConfig {
    WolfKvConfig {
        node: NodeConfig {
            url: url.to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: std::env::temp_dir(),
        },
        cluster: ClusterConfig {
            master: master.is_none(),
            master_address: master.map(String::from),
            shared_secret: "test-secret".to_string(),
            read_log_limit: 2,
            host_update_threshold: 2,
            election_threshold: 4,
            busy_interval_ms: 2,
            idle_interval_ms: 5,
            request_timeout_ms: 1000,
            host_refresh_interval_ms: 20,
            push_queue_size: 64,
        },
        store: StoreConfig {
            backend: StoreBackend::Memory,
            path: None,
        },
        logging: LoggingConfig::default(),
    }
}

/// Nodes sharing one loopback network
pub struct TestCluster {
    pub transport: Arc<LoopbackTransport>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            transport: LoopbackTransport::new(),
        }
    }

    pub async fn start_master(&self, url: &str) -> WolfKvNode {
        self.start(test_config(url, None)).await
    }

    pub async fn start_follower(&self, url: &str, master: &str) -> WolfKvNode {
        self.start(test_config(url, Some(master))).await
    }

    pub async fn start(&self, config: WolfKvConfig) -> WolfKvNode {
        let node = WolfKvNode::open(&config, Arc::new(MemoryStore::new()), self.transport.clone())
            .await
            .unwrap();
        self.transport.register(&config.node.url, node.service().clone());
        node
    }
}
