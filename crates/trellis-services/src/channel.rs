//! Message channel — the node's peer-facing mailbox.
//!
//! Peers connect over TCP and introduce themselves with a single identity
//! frame. Every later message from a peer is surfaced as `[identity][payload]`
//! and raised as [`ChannelEvent::Received`] with `sender` set to the identity.
//! Replies (envelopes with a `sender`) are routed back over the connection
//! registered under that identity.
//!
//! State machine: `Closed → Open → Closing → Closed`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

use trellis_core::endpoint::{EndpointError, MAX_EPHEMERAL_PORT, MIN_EPHEMERAL_PORT};
use trellis_core::{ControlEnvelope, Endpoint};

use crate::frame::{read_message, write_message};

const LOOPBACK_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// An envelope arrived from a peer.
    Received(ControlEnvelope),
    /// A local component issued a new outbound request.
    Sent(ControlEnvelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Open,
    Closing,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is already open")]
    AlreadyOpen,

    #[error("channel is closed")]
    Closed,

    #[error("invalid mailbox endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("no free port in {MIN_EPHEMERAL_PORT}..={MAX_EPHEMERAL_PORT}")]
    NoFreePort,
}

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>>;

/// A reply on its way to the multiplex loop.
struct Reply {
    identity: Vec<u8>,
    payload: Bytes,
    routed: oneshot::Sender<bool>,
}

pub struct MessageChannel {
    requested: Endpoint,
    bound: Mutex<Option<Endpoint>>,
    state: Mutex<ChannelState>,
    running: Arc<AtomicBool>,
    listeners: Listeners,
    loopback: Mutex<Option<mpsc::Sender<Reply>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageChannel {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            requested: endpoint,
            bound: Mutex::new(None),
            state: Mutex::new(ChannelState::Closed),
            running: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            loopback: Mutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// The bound endpoint. The address is kept as configured (possibly `*`);
    /// the port is the one actually bound.
    pub fn endpoint(&self) -> Option<Endpoint> {
        lock(&self.bound).clone()
    }

    /// Register a listener. It receives every event raised after this call.
    pub fn add_listener(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.listeners).push(tx);
        rx
    }

    /// Bind the mailbox and start the multiplex loop.
    pub async fn open(&self) -> Result<Endpoint, ChannelError> {
        {
            let mut state = lock(&self.state);
            if *state != ChannelState::Closed {
                return Err(ChannelError::AlreadyOpen);
            }
            *state = ChannelState::Open;
        }

        let listener = match bind_mailbox(&self.requested).await {
            Ok(l) => l,
            Err(e) => {
                *lock(&self.state) = ChannelState::Closed;
                return Err(e);
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                *lock(&self.state) = ChannelState::Closed;
                return Err(ChannelError::Bind(self.requested.socket_addr()?, e));
            }
        };
        let bound = self.requested.with_port(port);

        let (loopback_tx, loopback_rx) = mpsc::channel(LOOPBACK_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        self.running.store(true, Ordering::Release);
        *lock(&self.bound) = Some(bound.clone());
        *lock(&self.loopback) = Some(loopback_tx);
        *lock(&self.shutdown) = Some(shutdown_tx);

        let task = tokio::spawn(
            Multiplexer {
                listener,
                loopback: loopback_rx,
                inbound_tx,
                inbound_rx,
                connections: HashMap::new(),
                next_conn: 0,
                readers: JoinSet::new(),
                listeners: self.listeners.clone(),
                shutdown: shutdown_rx,
            }
            .run(),
        );
        *lock(&self.task) = Some(task);

        tracing::info!(endpoint = %bound, "message channel open");
        Ok(bound)
    }

    /// Send an envelope.
    ///
    /// With a `sender` the envelope is a reply: it is routed to that peer and
    /// the result says whether the peer was reachable. Without one it is a new
    /// request, raised to listeners as [`ChannelEvent::Sent`].
    pub async fn send(&self, envelope: ControlEnvelope) -> Result<bool, ChannelError> {
        let Some(identity) = envelope.sender.clone() else {
            emit(&self.listeners, ChannelEvent::Sent(envelope));
            return Ok(true);
        };

        if !self.running.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let loopback = lock(&self.loopback).clone().ok_or(ChannelError::Closed)?;

        let mut outgoing = envelope;
        outgoing.sender = None;
        let (routed_tx, routed_rx) = oneshot::channel();
        let reply = Reply {
            identity,
            payload: Bytes::from(outgoing.to_bytes()),
            routed: routed_tx,
        };

        match loopback.try_send(reply) {
            Ok(()) => {}
            Err(TrySendError::Full(reply)) => {
                if !self.running.load(Ordering::Acquire) {
                    return Err(ChannelError::Closed);
                }
                loopback.send(reply).await.map_err(|_| ChannelError::Closed)?;
            }
            Err(TrySendError::Closed(_)) => return Err(ChannelError::Closed),
        }

        Ok(routed_rx.await.unwrap_or(false))
    }

    /// Stop the multiplex loop, waiting at most `timeout`. Idempotent.
    pub async fn close(&self, timeout: Duration) {
        {
            let mut state = lock(&self.state);
            if *state != ChannelState::Open {
                return;
            }
            *state = ChannelState::Closing;
        }

        self.running.store(false, Ordering::Release);
        if let Some(shutdown) = lock(&self.shutdown).take() {
            shutdown.send_replace(true);
        }
        lock(&self.loopback).take();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                tracing::warn!("message channel loop did not stop in time, aborting");
                abort.abort();
            }
        }

        *lock(&self.state) = ChannelState::Closed;
        tracing::info!(endpoint = ?self.endpoint(), "message channel closed");
    }
}

// ── Multiplex loop ────────────────────────────────────────────────────────────

enum Inbound {
    Connected {
        conn: u64,
        identity: Vec<u8>,
        writer: mpsc::UnboundedSender<Bytes>,
    },
    Message {
        frames: Vec<Bytes>,
    },
    Disconnected {
        conn: u64,
        identity: Vec<u8>,
    },
}

struct Connection {
    conn: u64,
    writer: mpsc::UnboundedSender<Bytes>,
}

struct Multiplexer {
    listener: TcpListener,
    loopback: mpsc::Receiver<Reply>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    connections: HashMap<Vec<u8>, Connection>,
    next_conn: u64,
    readers: JoinSet<()>,
    listeners: Listeners,
    shutdown: watch::Receiver<bool>,
}

impl Multiplexer {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.changed() => break,

                reply = self.loopback.recv() => {
                    let Some(reply) = reply else { break };
                    self.route_reply(reply);
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(from = %addr, "mailbox connection accepted");
                            let conn = self.next_conn;
                            self.next_conn += 1;
                            self.readers.spawn(serve_connection(conn, stream, self.inbound_tx.clone()));
                        }
                        Err(e) => tracing::warn!(error = %e, "mailbox accept failed"),
                    }
                }

                inbound = self.inbound_rx.recv() => {
                    if let Some(inbound) = inbound {
                        self.on_inbound(inbound);
                    }
                }

                Some(_) = self.readers.join_next(), if !self.readers.is_empty() => {}
            }
        }

        self.readers.shutdown().await;
        tracing::debug!("multiplex loop stopped");
    }

    fn route_reply(&mut self, reply: Reply) {
        let routed = match self.connections.get(&reply.identity) {
            Some(connection) => connection.writer.send(reply.payload).is_ok(),
            None => false,
        };
        if !routed {
            tracing::debug!(peer = %hex::encode(&reply.identity), "reply to unknown peer dropped");
        }
        let _ = reply.routed.send(routed);
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Connected { conn, identity, writer } => {
                tracing::debug!(peer = %hex::encode(&identity), "peer registered");
                self.connections.insert(identity, Connection { conn, writer });
            }
            Inbound::Disconnected { conn, identity } => {
                if self.connections.get(&identity).map(|c| c.conn) == Some(conn) {
                    self.connections.remove(&identity);
                    tracing::debug!(peer = %hex::encode(&identity), "peer disconnected");
                }
            }
            Inbound::Message { frames } => self.on_message(frames),
        }
    }

    fn on_message(&self, frames: Vec<Bytes>) {
        let [identity, payload] = frames.as_slice() else {
            tracing::warn!(frames = frames.len(), "unexpected frame count, dropping message");
            return;
        };

        let mut envelope = match ControlEnvelope::from_bytes(payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(peer = %hex::encode(identity), error = %e, "undecodable envelope, dropping");
                return;
            }
        };
        envelope.sender = Some(identity.to_vec());

        tracing::debug!(
            peer = %hex::encode(identity),
            kind = envelope.message_type().as_str(),
            id = envelope.id,
            "envelope received"
        );
        emit(&self.listeners, ChannelEvent::Received(envelope));
    }
}

/// Read the identity greeting, register a writer, then forward every message
/// as `[identity][frames...]`.
async fn serve_connection(conn: u64, stream: TcpStream, inbound: mpsc::UnboundedSender<Inbound>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let identity = match read_message(&mut reader).await {
        Ok(Some(frames)) if frames.len() == 1 && !frames[0].is_empty() => frames[0].to_vec(),
        Ok(Some(frames)) => {
            tracing::warn!(frames = frames.len(), "invalid identity greeting");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            tracing::debug!(error = %e, "identity greeting failed");
            return;
        }
    };

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Bytes>();
    let write_task = tokio::spawn(async move {
        while let Some(payload) = writer_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &[payload]).await {
                tracing::debug!(error = %e, "mailbox write failed");
                break;
            }
        }
    });

    if inbound
        .send(Inbound::Connected {
            conn,
            identity: identity.clone(),
            writer: writer_tx,
        })
        .is_err()
    {
        write_task.abort();
        return;
    }

    loop {
        match read_message(&mut reader).await {
            Ok(Some(frames)) => {
                let mut message = Vec::with_capacity(frames.len() + 1);
                message.push(Bytes::from(identity.clone()));
                message.extend(frames);
                if inbound.send(Inbound::Message { frames: message }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(peer = %hex::encode(&identity), error = %e, "mailbox read failed");
                break;
            }
        }
    }

    let _ = inbound.send(Inbound::Disconnected { conn, identity });
    write_task.abort();
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Bind `endpoint`. Port 0 probes the ephemeral range in order and takes the
/// first free port.
async fn bind_mailbox(endpoint: &Endpoint) -> Result<TcpListener, ChannelError> {
    let addr = endpoint.socket_addr()?;
    if addr.port() != 0 {
        return TcpListener::bind(addr)
            .await
            .map_err(|e| ChannelError::Bind(addr, e));
    }

    for port in MIN_EPHEMERAL_PORT..=MAX_EPHEMERAL_PORT {
        if let Ok(listener) = TcpListener::bind(SocketAddr::new(addr.ip(), port)).await {
            return Ok(listener);
        }
    }
    Err(ChannelError::NoFreePort)
}

fn emit(listeners: &Listeners, event: ChannelEvent) {
    let mut listeners = lock(listeners);
    listeners.retain(|l| l.send(event.clone()).is_ok());
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
