//! WolfKV - Replicated Ordered Key-Value Core
//!
//! Runs one replication node: the embedded store, the HTTP replication
//! endpoint and the synchronization coordinator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfkv::config::WolfKvConfig;
use wolfkv::network::{HttpTransport, ReplicationServer};
use wolfkv::store::open_store;
use wolfkv::WolfKvNode;

/// WolfKV - Replicated Ordered Key-Value Core
#[derive(Parser)]
#[command(name = "wolfkv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfkv.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfKV node
    Start {
        /// Start as master regardless of the configuration file
        #[arg(long)]
        master: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfkv.toml")]
        output: PathBuf,

        /// Advertised URL of the node
        #[arg(long, default_value = "http://127.0.0.1:7700")]
        url: String,

        /// Generate a master configuration
        #[arg(long)]
        master: bool,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { master } => run_start(cli.config, cli.log_level, master).await,
        Commands::Init { output, url, master } => run_init(output, url, master),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the WolfKV node
async fn run_start(config_path: PathBuf, log_level: Option<String>, master: bool) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let mut config = WolfKvConfig::parse(&content)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    if master {
        config.cluster.master = true;
    }
    config.validate()?;

    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    tracing::info!("Starting WolfKV node {}", config.node.url);

    let store = open_store(&config).context("failed to open store")?;
    let transport = Arc::new(HttpTransport::from_config(&config)?);
    let node = WolfKvNode::open(&config, store, transport)
        .await
        .context("key-space recovery failed")?;

    let server = ReplicationServer::new(
        config.node.bind_address.clone(),
        node.service().clone(),
        config.cluster.shared_secret.clone(),
    );
    let shutdown = node.context().shutdown_token();
    let mut server_task = tokio::spawn(async move { server.start(shutdown).await });
    let mut sync_task = node.spawn_sync();

    let mut failure = None;
    let mut sync_done = false;
    let mut server_done = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        result = &mut sync_task => {
            sync_done = true;
            failure = task_failure("replication", result);
        }
        result = &mut server_task => {
            server_done = true;
            failure = task_failure("replication endpoint", result);
        }
    }

    node.shutdown();

    if !sync_done {
        if let Some(e) = task_failure("replication", sync_task.await) {
            failure.get_or_insert(e);
        }
    }
    if !server_done {
        if let Some(e) = task_failure("replication endpoint", server_task.await) {
            failure.get_or_insert(e);
        }
    }

    match failure {
        Some(e) => {
            tracing::error!("{:#}", e);
            Err(e)
        }
        None => {
            tracing::info!("WolfKV node stopped");
            Ok(())
        }
    }
}

fn task_failure(name: &str, result: Result<wolfkv::Result<()>, JoinError>) -> Option<anyhow::Error> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(anyhow::Error::new(e).context(format!("{} failed", name))),
        Err(e) => Some(anyhow::anyhow!("{} task aborted: {}", name, e)),
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, url: String, master: bool) -> anyhow::Result<()> {
    let cluster = if master {
        "master = true".to_string()
    } else {
        "master = false\nmaster_address = \"http://master.example.com:7700\"".to_string()
    };

    let config_content = format!(
        r#"# WolfKV Configuration
# Generated configuration file

[node]
url = "{url}"
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/wolfkv"

[cluster]
{cluster}
shared_secret = "change-me"
read_log_limit = 500
host_update_threshold = 3
election_threshold = 10
busy_interval_ms = 50
idle_interval_ms = 1000
request_timeout_ms = 5000
host_refresh_interval_ms = 5000
push_queue_size = 1024

[store]
backend = "sqlite"
# path = "/var/lib/wolfkv/wolfkv.db"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nSet cluster.shared_secret to the same value on every node.");
    println!("Then start with: wolfkv start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfKvConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Node URL:     {}", config.node.url);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Role:         {}", if config.cluster.master { "master" } else { "follower" });
            if let Some(master) = config.master_address() {
                println!("  Master:       {}", master);
            }
            println!("  Store:        {:?} at {}", config.store.backend, config.store_path().display());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            Err(e.into())
        }
    }
}
