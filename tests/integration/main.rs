//! Trellis integration test harness.
//!
//! Every scenario runs two or more in-process nodes against real loopback
//! TCP sockets. Beacons are injected directly into the discovery engine so
//! tests do not depend on broadcast delivery; the UDP path is covered by the
//! broadcaster's own tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use trellis_core::{Beacon, Endpoint, FactSet};
use trellis_services::{DiscoveryOptions, Node, QueryCallback};

mod discovery;
mod lifecycle;
mod queries;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SHUTDOWN: Duration = Duration::from_secs(2);

/// A UDP port nothing else is listening on, so each node gets its own
/// beacon listener.
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .unwrap_or(0)
}

/// Options for a node that never broadcasts.
pub fn quiet_options() -> DiscoveryOptions {
    DiscoveryOptions {
        broadcast_port: free_udp_port(),
        active_broadcast: false,
        broadcast_destination: IpAddr::V4(Ipv4Addr::LOCALHOST),
        close_timeout: Duration::from_secs(1),
        ..DiscoveryOptions::default()
    }
}

/// Start a node whose mailbox listens on loopback.
pub async fn spawn_node(services: &[FactSet]) -> Result<Node> {
    let node = Node::new(Endpoint::tcp("127.0.0.1", 0), quiet_options());
    for facts in services {
        node.announce_local(facts.clone());
    }
    node.start().await?;
    Ok(node)
}

/// Tell `node` that `other` exists, as if a beacon from it had arrived.
pub async fn introduce(node: &Node, other: &Node) -> Result<()> {
    let Some(endpoint) = other.endpoint() else {
        bail!("node {} has not started", other.peer_id());
    };
    node.engine()
        .on_beacon(Beacon {
            peer_id: other.peer_id(),
            endpoint,
        })
        .await;
    Ok(())
}

/// Poll `condition` every 20ms until it holds or `timeout` expires.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("condition not met within {:?}", timeout)
}

/// A query callback that records every endpoint it is given.
pub fn recorder() -> (QueryCallback, Arc<Mutex<Vec<Endpoint>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: QueryCallback = Arc::new(move |endpoint| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(endpoint);
        }
    });
    (callback, seen)
}

pub fn echo_service() -> FactSet {
    FactSet::new().with("name", "echo").with("version", "1")
}
