//! BeeGFS Management Daemon
//!
//! Keeps the authoritative node, target, state and buddy group registries
//! and serves them to the other daemons.

use beegfs_mgmtd::{metrics, MgmtConfig, MgmtDaemon};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beegfs-mgmtd")]
#[command(about = "BeeGFS management daemon")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/beegfs/beegfs-mgmtd.toml")]
    config: PathBuf,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Accept registrations of unknown meta and storage servers
    #[arg(long)]
    allow_new_servers: Option<bool>,

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

    info!("BeeGFS management daemon starting...");

    // Priority: CLI args > environment > config file > defaults
    let config = MgmtConfig::load_or_default(&cli.config)
        .with_env_overrides()
        .with_overrides(cli.port, cli.allow_new_servers);
    config.validate()?;

    if config.metrics.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
        metrics::init_metrics(addr)?;
        info!(%addr, "Prometheus exporter listening");
    }

    let listen_addr = config.mgmt.listen_addr()?;
    let listener = TcpListener::bind(listen_addr).await?;

    info!(
        addr = %listen_addr,
        offline_timeout_secs = config.sys.target_offline_timeout_secs,
        "Starting BeeGFS management daemon"
    );

    let daemon = MgmtDaemon::new(config)?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    if let Err(e) = daemon.run(listener, cancel).await {
        error!(error = %e, "Management daemon failed");
        return Err(e.into());
    }

    info!("Management daemon stopped");
    Ok(())
}
