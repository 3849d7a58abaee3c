//! Discovery engine — the tracker registry and query correlation.
//!
//! Turns beacons and unsolicited Hellos into [`Tracker`]s, answers
//! `find_services` from the local directory or fans the query out to every
//! tracker, and resolves Responses against the in-flight table.
//!
//! Lock order is `trackers` → `pending` → `discovered`. Nothing awaits while a lock is held;
//! tracker sends are queue pushes.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use trellis_core::config::NetworkConfig;
use trellis_core::message::QUERY_SERVICE_TOKEN;
use trellis_core::wire::{DEFAULT_BROADCAST_INTERVAL_SECS, DEFAULT_BROADCAST_PORT};
use trellis_core::{
    Beacon, ControlEnvelope, ControlMessage, CorrelationId, Endpoint, FactSet, PeerId,
};

use crate::broadcast::Broadcaster;
use crate::directory::ServiceDirectory;
use crate::tracker::{Tracker, TrackerConnector};

/// Invoked once per endpoint that answers a query.
pub type QueryCallback = Arc<dyn Fn(Endpoint) + Send + Sync>;

const BEACON_QUEUE: usize = 256;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub broadcast_port: u16,
    pub broadcast_interval: Duration,
    /// If false, beacons are received but never sent.
    pub active_broadcast: bool,
    pub broadcast_destination: IpAddr,
    /// Bound for closing a replaced tracker's channel.
    pub close_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            broadcast_port: DEFAULT_BROADCAST_PORT,
            broadcast_interval: Duration::from_secs(DEFAULT_BROADCAST_INTERVAL_SECS),
            active_broadcast: true,
            broadcast_destination: IpAddr::V4(Ipv4Addr::BROADCAST),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&NetworkConfig> for DiscoveryOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            broadcast_port: config.broadcast_port,
            broadcast_interval: config.broadcast_interval(),
            active_broadcast: config.active_broadcast,
            close_timeout: config.shutdown_timeout(),
            ..Self::default()
        }
    }
}

// ── Results and errors ────────────────────────────────────────────────────────

/// How `find_services` handled a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOutcome {
    /// Answered from the local directory; the callback ran this many times.
    Local(usize),
    /// Sent to every known tracker.
    Dispatched(CorrelationId),
    /// No tracker yet; sent when the first one is discovered.
    Queued(CorrelationId),
    /// The engine has shut down; the query was dropped.
    Stopped,
}

impl FindOutcome {
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            FindOutcome::Local(_) | FindOutcome::Stopped => None,
            FindOutcome::Dispatched(id) | FindOutcome::Queued(id) => Some(*id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery engine already started")]
    AlreadyStarted,

    #[error("failed to listen for beacons: {0}")]
    Listen(std::io::Error),

    #[error("failed to start beacon broadcast: {0}")]
    Broadcast(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Beacon,
    Hello,
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<Inner>,
}

struct Inner {
    peer_id: PeerId,
    options: DiscoveryOptions,
    directory: ServiceDirectory,
    connector: Arc<dyn TrackerConnector>,
    broadcaster: Broadcaster,
    endpoint: Mutex<Option<Endpoint>>,
    started: AtomicBool,
    stopped: AtomicBool,
    trackers: Mutex<HashMap<PeerId, Arc<Tracker>>>,
    pending: Mutex<VecDeque<ControlEnvelope>>,
    in_flight: Mutex<HashMap<CorrelationId, QueryCallback>>,
    next_id: AtomicU64,
    discovered: Mutex<Vec<mpsc::UnboundedSender<Arc<Tracker>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryEngine {
    pub fn new(
        peer_id: PeerId,
        directory: ServiceDirectory,
        connector: Arc<dyn TrackerConnector>,
        options: DiscoveryOptions,
    ) -> Self {
        let broadcaster = Broadcaster::new(options.broadcast_interval, options.broadcast_port)
            .with_destination(options.broadcast_destination);

        Self {
            inner: Arc::new(Inner {
                peer_id,
                options,
                directory,
                connector,
                broadcaster,
                endpoint: Mutex::new(None),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                trackers: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                discovered: Mutex::new(Vec::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Start listening for beacons and, if enabled, broadcasting our own.
    ///
    /// `bind` is the mailbox endpoint actually bound. A wildcard address is
    /// replaced by this host's IPv4 address. Returns the advertised endpoint.
    pub fn start(&self, bind: &Endpoint) -> Result<Endpoint, DiscoveryError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(DiscoveryError::AlreadyStarted);
        }

        let endpoint = if bind.is_wildcard() {
            bind.with_address(local_ipv4().to_string())
        } else {
            bind.clone()
        };
        *lock(&self.inner.endpoint) = Some(endpoint.clone());

        let (beacons_tx, beacons_rx) = mpsc::channel(BEACON_QUEUE);
        self.inner
            .broadcaster
            .listen(beacons_tx)
            .map_err(DiscoveryError::Listen)?;
        *lock(&self.inner.pump) = Some(tokio::spawn(beacon_pump(
            Arc::downgrade(&self.inner),
            beacons_rx,
        )));

        if self.inner.options.active_broadcast {
            self.inner
                .broadcaster
                .broadcast(self.inner.peer_id, endpoint.port)
                .map_err(DiscoveryError::Broadcast)?;
        }

        tracing::info!(
            peer = %self.inner.peer_id,
            endpoint = %endpoint,
            active_broadcast = self.inner.options.active_broadcast,
            "discovery engine started"
        );
        Ok(endpoint)
    }

    /// Stop the broadcaster, empty the registry and close every tracker
    /// channel concurrently, each bounded by `timeout`.
    /// Once stopped the engine registers no trackers and sends nothing.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.broadcaster.stop();
        self.inner.broadcaster.join(timeout).await;
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }

        let trackers: Vec<Arc<Tracker>> = lock(&self.inner.trackers).drain().map(|(_, t)| t).collect();
        let closes = trackers.iter().map(|t| async move {
            if tokio::time::timeout(timeout, t.close(timeout)).await.is_err() {
                tracing::warn!(peer = %t.peer_id().short(), "tracker close timed out");
            }
        });
        futures::future::join_all(closes).await;

        tracing::info!(trackers = trackers.len(), "discovery engine stopped");
    }

    // ── Tracker registry ──────────────────────────────────────────────────────

    pub async fn on_beacon(&self, beacon: Beacon) {
        if beacon.peer_id == self.inner.peer_id {
            tracing::trace!("ignoring own beacon");
            return;
        }
        self.register(beacon.peer_id, beacon.endpoint, Origin::Beacon)
            .await;
    }

    /// A peer introduced itself. `sender` is its connection identity.
    pub async fn on_hello(&self, sender: &[u8], address: &str, port: u16) {
        let Some(peer_id) = PeerId::from_slice(sender) else {
            tracing::warn!(sender = %hex::encode(sender), "hello with malformed sender identity");
            return;
        };
        if peer_id == self.inner.peer_id {
            return;
        }

        let endpoint = Endpoint::tcp(address, port);
        if port == 0 || endpoint.is_wildcard() || endpoint.socket_addr().is_err() {
            tracing::warn!(
                peer = %peer_id.short(),
                endpoint = %endpoint,
                "hello with unusable mailbox endpoint, dropping"
            );
            return;
        }
        self.register(peer_id, endpoint, Origin::Hello).await;
    }

    async fn register(&self, peer_id: PeerId, endpoint: Endpoint, origin: Origin) {
        let replaced = {
            let mut trackers = lock(&self.inner.trackers);
            if self.is_stopped() {
                tracing::debug!(peer = %peer_id.short(), "engine stopped, ignoring peer");
                return;
            }

            if let Some(existing) = trackers.get(&peer_id) {
                if existing.endpoint() == &endpoint {
                    existing.touch();
                    return;
                }
            }

            let channel = self.inner.connector.connect(peer_id, &endpoint);
            let tracker = Arc::new(Tracker::new(peer_id, endpoint, channel));
            let replaced = trackers.insert(peer_id, tracker.clone());

            tracing::info!(
                peer = %peer_id.short(),
                endpoint = %tracker.endpoint(),
                via = ?origin,
                "tracker discovered"
            );
            self.on_tracker_discovered(&tracker, origin == Origin::Beacon);
            replaced
        };

        if let Some(old) = replaced {
            tracing::info!(
                peer = %peer_id.short(),
                old = %old.endpoint(),
                "peer endpoint changed, closing old tracker"
            );
            old.close(self.inner.options.close_timeout).await;
        }
    }

    /// Runs with the trackers lock held so a concurrent `find_services`
    /// either sees this tracker or has already queued its query.
    fn on_tracker_discovered(&self, tracker: &Arc<Tracker>, say_hello: bool) {
        if say_hello {
            match self.endpoint() {
                Some(own) => {
                    let hello = ControlEnvelope::new(
                        self.next_id(),
                        ControlMessage::hello(own.address.clone(), own.port),
                    );
                    tracker.send(hello);
                }
                None => tracing::debug!("engine not started, skipping hello"),
            }
        }

        let mut pending = lock(&self.inner.pending);
        let drained = pending.len();
        while let Some(query) = pending.pop_front() {
            tracker.send(query);
        }
        drop(pending);
        if drained > 0 {
            tracing::debug!(peer = %tracker.peer_id().short(), count = drained, "pending queries sent");
        }

        lock(&self.inner.discovered).retain(|s| s.send(tracker.clone()).is_ok());
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Find endpoints hosting services that match `facts`.
    pub fn find_services(&self, facts: &FactSet, callback: QueryCallback) -> FindOutcome {
        if self.is_stopped() {
            tracing::debug!("engine stopped, dropping query");
            return FindOutcome::Stopped;
        }

        let local = self.inner.directory.query(facts);
        if !local.is_empty() {
            let count = local.len();
            for endpoint in local {
                callback(endpoint);
            }
            return FindOutcome::Local(count);
        }

        let id = self.next_id();
        lock(&self.inner.in_flight).insert(id, callback);
        let query = ControlEnvelope::new(id, ControlMessage::query(facts.clone()))
            .with_token(QUERY_SERVICE_TOKEN);

        let trackers = lock(&self.inner.trackers);
        if trackers.is_empty() {
            lock(&self.inner.pending).push_back(query);
            tracing::debug!(id, "no trackers yet, query queued");
            return FindOutcome::Queued(id);
        }

        for tracker in trackers.values() {
            tracker.send(query.clone());
        }
        tracing::debug!(id, trackers = trackers.len(), "query dispatched");
        FindOutcome::Dispatched(id)
    }

    /// Route a Response by its token.
    pub fn on_response(&self, envelope: &ControlEnvelope) {
        match envelope.token.as_str() {
            QUERY_SERVICE_TOKEN => self.on_query_service_response(envelope),
            other => tracing::trace!(token = other, "response with unrouted token"),
        }
    }

    fn on_query_service_response(&self, envelope: &ControlEnvelope) {
        let ControlMessage::Response { endpoints } = &envelope.message else {
            tracing::warn!(kind = envelope.message_type().as_str(), "query token on a non-response");
            return;
        };

        // Only the caller that removes the entry invokes the callback.
        let Some(callback) = lock(&self.inner.in_flight).remove(&envelope.id) else {
            tracing::trace!(id = envelope.id, "response for unknown or completed query");
            return;
        };

        for raw in endpoints {
            match raw.parse::<Endpoint>() {
                Ok(endpoint) => callback(endpoint),
                Err(e) => tracing::warn!(endpoint = %raw, error = %e, "skipping invalid endpoint"),
            }
        }
    }

    // ── Announcements ─────────────────────────────────────────────────────────

    pub fn announce_to(&self, facts: &FactSet, tracker: &Tracker) -> bool {
        let envelope = ControlEnvelope::new(self.next_id(), ControlMessage::announce(facts.clone()));
        tracker.send(envelope)
    }

    /// Announce `facts` to every tracker. Returns how many accepted it.
    pub fn announce(&self, facts: &FactSet) -> usize {
        if self.is_stopped() {
            return 0;
        }
        let trackers = lock(&self.inner.trackers);
        trackers
            .values()
            .filter(|t| self.announce_to(facts, t))
            .count()
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Advertised mailbox endpoint; None before `start`.
    pub fn endpoint(&self) -> Option<Endpoint> {
        lock(&self.inner.endpoint).clone()
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.inner.directory
    }

    pub fn tracker(&self, peer_id: &PeerId) -> Option<Arc<Tracker>> {
        lock(&self.inner.trackers).get(peer_id).cloned()
    }

    pub fn trackers(&self) -> Vec<Arc<Tracker>> {
        lock(&self.inner.trackers).values().cloned().collect()
    }

    pub fn tracker_count(&self) -> usize {
        lock(&self.inner.trackers).len()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Receive every tracker discovered from now on. The queue is unbounded:
    /// every notification reaches every live subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<Tracker>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.discovered).push(tx);
        rx
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    fn next_id(&self) -> CorrelationId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn beacon_pump(engine: Weak<Inner>, mut beacons: mpsc::Receiver<Beacon>) {
    while let Some(beacon) = beacons.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        DiscoveryEngine { inner }.on_beacon(beacon).await;
    }
}

/// First non-loopback IPv4 address of this host, or 127.0.0.1.
///
/// Connecting a UDP socket sends nothing; it only selects the outgoing
/// interface.
pub fn local_ipv4() -> Ipv4Addr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("10.254.254.254:1")?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(IpAddr::V4(ip)) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
