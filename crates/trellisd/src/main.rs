//! trellisd — Trellis node daemon.

use std::time::Duration;

use anyhow::{Context, Result};

use trellis_core::config::TrellisConfig;
use trellis_services::Node;

mod status;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TrellisConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TrellisConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TrellisConfig::default()
    });
    tracing::info!(
        mailbox = %config.network.mailbox,
        broadcast_port = config.network.broadcast_port,
        active_broadcast = config.network.active_broadcast,
        services = config.services.len(),
        "trellisd starting"
    );

    let node = Node::from_config(&config).context("invalid node configuration")?;
    let endpoint = node.start().await.context("failed to start node")?;
    tracing::info!(peer = %node.peer_id(), endpoint = %endpoint, "node ready");

    let mut snapshot_task = tokio::spawn(status::snapshot_loop(
        node.engine().clone(),
        node.directory().clone(),
        SNAPSHOT_INTERVAL,
    ));

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        r = tokio::signal::ctrl_c() => match r {
            Ok(()) => tracing::info!("shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
        },
        r = &mut snapshot_task => tracing::error!("snapshot task exited: {:?}", r),
    }
    snapshot_task.abort();

    node.shutdown(config.network.shutdown_timeout()).await;
    status::log_snapshot(node.engine(), node.directory());
    tracing::info!("trellisd stopped");
    Ok(())
}
