//! Node — wires the mailbox, the discovery engine and the dispatcher into
//! one running peer.
//!
//! Event pumps:
//!   - mailbox events: `Received` is dispatched; `Sent` is a local request
//!     (Query → `find_services`, Announce → `announce_local`)
//!   - tracker replies: dispatched
//!   - tracker discoveries: every hosted service is announced to the new
//!     tracker

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use trellis_core::config::TrellisConfig;
use trellis_core::endpoint::EndpointError;
use trellis_core::{ControlEnvelope, ControlMessage, Endpoint, FactSet, PeerId};

use crate::channel::{ChannelError, ChannelEvent, MessageChannel};
use crate::directory::{ServiceDirectory, ServiceEndpoint};
use crate::discovery::{DiscoveryEngine, DiscoveryError, DiscoveryOptions, FindOutcome, QueryCallback};
use crate::dispatch::ControlDispatcher;
use crate::tracker::{TcpConnector, Tracker};

const RESPONSES_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node already started")]
    AlreadyStarted,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    peer_id: PeerId,
    directory: ServiceDirectory,
    engine: DiscoveryEngine,
    channel: Arc<MessageChannel>,
    dispatcher: ControlDispatcher,
    hosted: Mutex<Vec<FactSet>>,
    responses: broadcast::Sender<ControlEnvelope>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ControlEnvelope>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(mailbox: Endpoint, options: DiscoveryOptions) -> Self {
        let peer_id = PeerId::generate();
        let directory = ServiceDirectory::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let connector = Arc::new(TcpConnector::new(peer_id, inbound_tx));
        let engine = DiscoveryEngine::new(peer_id, directory.clone(), connector, options);
        let channel = Arc::new(MessageChannel::new(mailbox));
        let dispatcher = ControlDispatcher::new(engine.clone(), directory.clone(), channel.clone());
        let (responses, _) = broadcast::channel(RESPONSES_CAPACITY);

        Self {
            inner: Arc::new(NodeInner {
                peer_id,
                directory,
                engine,
                channel,
                dispatcher,
                hosted: Mutex::new(Vec::new()),
                responses,
                inbound: Mutex::new(Some(inbound_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build a node from configuration, including its hosted services.
    pub fn from_config(config: &TrellisConfig) -> Result<Self, NodeError> {
        let mailbox = config.network.mailbox_endpoint()?;
        let node = Self::new(mailbox, DiscoveryOptions::from(&config.network));
        lock(&node.inner.hosted).extend(config.services.iter().map(|s| s.facts.clone()));
        Ok(node)
    }

    /// Open the mailbox, start discovery and spawn the event pumps.
    /// Returns the advertised mailbox endpoint.
    pub async fn start(&self) -> Result<Endpoint, NodeError> {
        let inbound = lock(&self.inner.inbound)
            .take()
            .ok_or(NodeError::AlreadyStarted)?;

        let events = self.inner.channel.add_listener();
        let discovered = self.inner.engine.subscribe();

        let bound = self.inner.channel.open().await?;
        let advertised = match self.inner.engine.start(&bound) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.inner.channel.close(Duration::from_secs(1)).await;
                return Err(e.into());
            }
        };

        let hosted = self.hosted_services();
        for facts in &hosted {
            self.inner
                .directory
                .add(ServiceEndpoint::new(advertised.clone(), facts.clone()));
        }

        let tasks = vec![
            tokio::spawn(self.clone().mailbox_pump(events)),
            tokio::spawn(self.clone().reply_pump(inbound)),
            tokio::spawn(self.clone().discovery_pump(discovered)),
        ];
        lock(&self.inner.tasks).extend(tasks);

        tracing::info!(
            peer = %self.inner.peer_id,
            endpoint = %advertised,
            services = hosted.len(),
            "node started"
        );
        Ok(advertised)
    }

    /// Stop the event pumps, shut discovery down, then close the mailbox.
    pub async fn shutdown(&self, timeout: Duration) {
        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }

        self.inner.engine.shutdown(timeout).await;
        self.inner.channel.close(timeout).await;
        tracing::info!(peer = %self.inner.peer_id.short(), "node stopped");
    }

    // ── Services ──────────────────────────────────────────────────────────────

    /// Host a service: record it, publish it in the local directory at our
    /// mailbox endpoint and announce it to every tracker.
    /// Returns how many trackers accepted the announcement.
    pub fn announce_local(&self, facts: FactSet) -> usize {
        {
            let mut hosted = lock(&self.inner.hosted);
            if !hosted.contains(&facts) {
                hosted.push(facts.clone());
            }
        }

        if let Some(own) = self.inner.engine.endpoint() {
            self.inner
                .directory
                .add(ServiceEndpoint::new(own, facts.clone()));
        }
        self.inner.engine.announce(&facts)
    }

    pub fn find_services(&self, facts: &FactSet, callback: QueryCallback) -> FindOutcome {
        self.inner.engine.find_services(facts, callback)
    }

    /// Responses to local requests issued through the mailbox.
    pub fn subscribe_responses(&self) -> broadcast::Receiver<ControlEnvelope> {
        self.inner.responses.subscribe()
    }

    pub fn hosted_services(&self) -> Vec<FactSet> {
        lock(&self.inner.hosted).clone()
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.engine.endpoint()
    }

    pub fn engine(&self) -> &DiscoveryEngine {
        &self.inner.engine
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.inner.channel
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.inner.directory
    }

    // ── Pumps ─────────────────────────────────────────────────────────────────

    async fn mailbox_pump(self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Received(envelope) => self.inner.dispatcher.dispatch(envelope).await,
                ChannelEvent::Sent(envelope) => self.on_local_request(envelope),
            }
        }
    }

    async fn reply_pump(self, mut inbound: mpsc::UnboundedReceiver<ControlEnvelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.inner.dispatcher.dispatch(envelope).await;
        }
    }

    async fn discovery_pump(self, mut discovered: mpsc::UnboundedReceiver<Arc<Tracker>>) {
        while let Some(tracker) = discovered.recv().await {
            self.announce_hosted_to(&tracker);
        }
    }

    fn announce_hosted_to(&self, tracker: &Tracker) {
        let hosted = self.hosted_services();
        for facts in &hosted {
            self.inner.engine.announce_to(facts, tracker);
        }
        if !hosted.is_empty() {
            tracing::debug!(
                peer = %tracker.peer_id().short(),
                services = hosted.len(),
                "hosted services announced"
            );
        }
    }

    fn on_local_request(&self, envelope: ControlEnvelope) {
        match envelope.message {
            ControlMessage::Query { facts } => {
                let responses = self.inner.responses.clone();
                let id = envelope.id;
                let token = envelope.token;
                let callback: QueryCallback = Arc::new(move |endpoint: Endpoint| {
                    let response =
                        ControlEnvelope::new(id, ControlMessage::response([endpoint.to_string()]))
                            .with_token(token.clone());
                    let _ = responses.send(response);
                });
                let outcome = self.inner.engine.find_services(&facts, callback);
                tracing::debug!(id, outcome = ?outcome, "local query issued");
            }
            ControlMessage::Announce { facts } => {
                let reached = self.announce_local(facts);
                tracing::debug!(trackers = reached, "local service announced");
            }
            other => {
                tracing::debug!(
                    kind = other.message_type().as_str(),
                    "ignoring local request"
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
