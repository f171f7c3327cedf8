//! WolfKV Configuration
//!
//! Configuration structures for a WolfKV replication node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfKV configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfKvConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster / replication configuration
    pub cluster: ClusterConfig,

    /// Embedded store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Advertised base URL of this node; doubles as its host id
    pub url: String,

    /// Address to bind the replication endpoint on
    pub bind_address: String,

    /// Data directory for the store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Start this node as master
    #[serde(default)]
    pub master: bool,

    /// Base URL of the master to follow (required for followers)
    #[serde(default)]
    pub master_address: Option<String>,

    /// Shared secret authenticating inter-node requests
    #[serde(default)]
    pub shared_secret: String,

    /// Maximum entries per READ_LOG chunk
    #[serde(default = "default_read_log_limit")]
    pub read_log_limit: u32,

    /// Consecutive pull failures before probing all hosts
    #[serde(default = "default_host_update_threshold")]
    pub host_update_threshold: u32,

    /// Consecutive pull failures before running a master election
    #[serde(default = "default_election_threshold")]
    pub election_threshold: u32,

    /// Sleep after a pull that returned entries
    #[serde(default = "default_busy_interval_ms")]
    pub busy_interval_ms: u64,

    /// Sleep after an empty (heartbeat) pull
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// Per-request transport timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How often a master pushes its host table to followers
    #[serde(default = "default_host_refresh_interval_ms")]
    pub host_refresh_interval_ms: u64,

    /// Pending best-effort pushes before new ones are dropped
    #[serde(default = "default_push_queue_size")]
    pub push_queue_size: usize,
}

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// Embedded store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Database file (defaults to `<data_dir>/wolfkv.db`)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfkv")
}

fn default_read_log_limit() -> u32 {
    500
}

fn default_host_update_threshold() -> u32 {
    3
}

fn default_election_threshold() -> u32 {
    10
}

fn default_busy_interval_ms() -> u64 {
    50
}

fn default_idle_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_host_refresh_interval_ms() -> u64 {
    5000
}

fn default_push_queue_size() -> usize {
    1024
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            master: false,
            master_address: None,
            shared_secret: String::new(),
            read_log_limit: default_read_log_limit(),
            host_update_threshold: default_host_update_threshold(),
            election_threshold: default_election_threshold(),
            busy_interval_ms: default_busy_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            host_refresh_interval_ms: default_host_refresh_interval_ms(),
            push_queue_size: default_push_queue_size(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfKvConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating, for callers that apply overrides first
    pub fn parse(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.url.is_empty() {
            return Err(crate::Error::Config("node.url cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.shared_secret.is_empty() {
            return Err(crate::Error::Config("cluster.shared_secret cannot be empty".into()));
        }

        if !self.cluster.master && self.master_address().is_none() {
            return Err(crate::Error::Config(
                "cluster.master_address is required when cluster.master = false".into(),
            ));
        }

        if self.cluster.read_log_limit == 0 {
            return Err(crate::Error::Config("cluster.read_log_limit must be > 0".into()));
        }

        if self.cluster.host_update_threshold == 0 {
            return Err(crate::Error::Config("cluster.host_update_threshold must be > 0".into()));
        }

        if self.cluster.election_threshold <= self.cluster.host_update_threshold {
            return Err(crate::Error::Config(format!(
                "cluster.election_threshold ({}) must exceed cluster.host_update_threshold ({})",
                self.cluster.election_threshold, self.cluster.host_update_threshold
            )));
        }

        Ok(())
    }

    /// Configured master address, if any non-empty one is set
    pub fn master_address(&self) -> Option<&str> {
        self.cluster
            .master_address
            .as_deref()
            .filter(|addr| !addr.is_empty())
    }

    /// Get the store file path
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("wolfkv.db"))
    }

    pub fn busy_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.busy_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.idle_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    pub fn host_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.host_refresh_interval_ms)
    }
}
