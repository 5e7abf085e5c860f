//! Occupancy server - aggregates enter/exit reports into per-lot car counts
//!
//! Module structure:
//! - `domain/` - Identifiers, wire records, frames
//! - `io/` - HTTP server and client, capture and display devices
//! - `services/` - Registry, aggregator, detector, capture session
//! - `infra/` - Config, Metrics

use clap::Parser;
use lot_occupancy::infra::{Config, KeyPolicy, Metrics};
use lot_occupancy::io::{start_api_server, ApiState};
use lot_occupancy::services::{OccupancyAggregator, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Parking lot occupancy aggregation server
#[derive(Parser, Debug)]
#[command(name = "occupancy-server", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-request events
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("occupancy-server starting");

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let key_policy = match config.key_policy() {
        KeyPolicy::Random => "random",
        KeyPolicy::CollisionChecked => "collision_checked",
    };
    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        bind_address = %config.bind_address(),
        port = %config.port(),
        key_policy = %key_policy,
        metrics_interval_secs = %config.metrics_interval_secs(),
        "config_loaded"
    );

    let addr: SocketAddr = format!("{}:{}", config.bind_address(), config.port())
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(Registry::with_policy(config.key_policy()));
    let aggregator = Arc::new(OccupancyAggregator::in_memory(registry, metrics.clone()));
    let state = Arc::new(ApiState::new(aggregator, metrics.clone(), config.site_id()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Metrics reporter (lock-free reads with full summary)
    let metrics_interval = config.metrics_interval_secs();
    let reporter_metrics = metrics.clone();
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = start_api_server(addr, state, shutdown_rx).await {
        error!(error = %e, addr = %addr, "api_server_failed");
        return Err(e.into());
    }

    metrics.report().log();
    info!("occupancy-server shutdown complete");
    Ok(())
}
