//! Periodic tracker snapshot — logs who this node currently knows about.

use std::time::Duration;

use trellis_services::{DiscoveryEngine, ServiceDirectory};

/// Log a snapshot of the tracker table every `interval`. Runs until the task
/// is aborted.
pub async fn snapshot_loop(engine: DiscoveryEngine, directory: ServiceDirectory, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; skip it so startup isn't noisy.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        log_snapshot(&engine, &directory);
    }
}

pub fn log_snapshot(engine: &DiscoveryEngine, directory: &ServiceDirectory) {
    tracing::info!(
        trackers = engine.tracker_count(),
        pending = engine.pending_count(),
        in_flight = engine.in_flight_count(),
        services = directory.len(),
        "tracker table snapshot"
    );
    for tracker in engine.trackers() {
        tracing::info!(
            peer = %tracker.peer_id(),
            endpoint = %tracker.endpoint(),
            last_seen_secs = tracker.last_seen().elapsed().as_secs(),
            "  tracker"
        );
    }
}
