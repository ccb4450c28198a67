//! BeeGFS Storage Daemon
//!
//! Registers its targets with the management daemon, keeps the cluster
//! topology in sync and resyncs buddy mirror secondaries.

use beegfs_storage::{metrics, StorageConfig, StorageDaemon};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beegfs-storage")]
#[command(about = "BeeGFS storage daemon")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/beegfs/beegfs-storage.toml")]
    config: PathBuf,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Management daemon host (overrides config)
    #[arg(long)]
    mgmt_host: Option<String>,

    /// Metrics HTTP port (overrides config)
    #[arg(short, long)]
    metrics_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    info!("BeeGFS storage daemon starting...");

    // Priority: CLI args > environment > config file > defaults
    let mut config = StorageConfig::load_or_default(&cli.config)
        .with_env_overrides()
        .with_overrides(cli.port, cli.mgmt_host);
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
        config.metrics.enabled = true;
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        return Err(e.into());
    }

    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::install_exporter(SocketAddr::from(([0, 0, 0, 0], config.metrics.port)))?;
    }

    let listen_addr = config.node.listen_addr()?;
    let listener = TcpListener::bind(listen_addr).await?;

    info!(
        addr = %listen_addr,
        string_id = %config.node.string_id,
        mgmt = %format!("{}:{}", config.mgmt.host, config.mgmt.port),
        targets = config.targets.len(),
        "Starting BeeGFS storage daemon"
    );

    let daemon = StorageDaemon::new(config)?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    if let Err(e) = daemon.run(listener, cancel).await {
        error!(error = %e, "Storage daemon failed");
        return Err(e);
    }

    info!("Storage daemon stopped");
    Ok(())
}
