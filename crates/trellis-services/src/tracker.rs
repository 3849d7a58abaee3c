//! Trackers — live handles to discovered peers.
//!
//! A [`Tracker`] pairs a peer's identity and mailbox endpoint with the
//! control channel used to reach it. Channels are created through a
//! [`TrackerConnector`] so the discovery engine does not depend on a
//! concrete transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use trellis_core::{ControlEnvelope, Endpoint, PeerId};

use crate::frame::{read_message, write_message};

/// Delay between two connection attempts to an unreachable mailbox.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// ── Seams ─────────────────────────────────────────────────────────────────────

/// Outbound control path to one peer.
pub trait ControlChannel: Send + Sync {
    /// Queue `envelope` for delivery. Never blocks; false once closed.
    fn send(&self, envelope: ControlEnvelope) -> bool;

    /// Stop the channel, waiting at most `timeout`.
    fn close(&self, timeout: Duration) -> BoxFuture<'_, ()>;
}

/// Creates control channels for newly discovered peers.
pub trait TrackerConnector: Send + Sync {
    fn connect(&self, peer_id: PeerId, endpoint: &Endpoint) -> Arc<dyn ControlChannel>;
}

// ── Tracker ───────────────────────────────────────────────────────────────────

pub struct Tracker {
    peer_id: PeerId,
    endpoint: Endpoint,
    channel: Arc<dyn ControlChannel>,
    last_seen: Mutex<Instant>,
}

impl Tracker {
    pub fn new(peer_id: PeerId, endpoint: Endpoint, channel: Arc<dyn ControlChannel>) -> Self {
        Self {
            peer_id,
            endpoint,
            channel,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn send(&self, envelope: ControlEnvelope) -> bool {
        self.channel.send(envelope)
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|e| *e.into_inner())
    }

    /// Refresh `last_seen`.
    pub fn touch(&self) {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        *last_seen = Instant::now();
    }

    pub async fn close(&self, timeout: Duration) {
        self.channel.close(timeout).await;
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("peer_id", &self.peer_id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// ── TCP channel ───────────────────────────────────────────────────────────────

/// Connects trackers to remote mailboxes over TCP.
///
/// Envelopes the remote mailbox sends back are forwarded to `inbound` with
/// `sender` set to the remote peer id.
#[derive(Clone)]
pub struct TcpConnector {
    local_id: PeerId,
    inbound: mpsc::UnboundedSender<ControlEnvelope>,
}

impl TcpConnector {
    pub fn new(local_id: PeerId, inbound: mpsc::UnboundedSender<ControlEnvelope>) -> Self {
        Self { local_id, inbound }
    }
}

impl TrackerConnector for TcpConnector {
    fn connect(&self, peer_id: PeerId, endpoint: &Endpoint) -> Arc<dyn ControlChannel> {
        Arc::new(TcpTrackerChannel::spawn(
            self.local_id,
            peer_id,
            endpoint.clone(),
            self.inbound.clone(),
        ))
    }
}

pub struct TcpTrackerChannel {
    outbound: mpsc::UnboundedSender<ControlEnvelope>,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTrackerChannel {
    pub fn spawn(
        local_id: PeerId,
        remote_id: PeerId,
        endpoint: Endpoint,
        inbound: mpsc::UnboundedSender<ControlEnvelope>,
    ) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(
            ChannelTask {
                local_id,
                remote_id,
                endpoint,
                queue,
                inbound,
                shutdown: shutdown_rx,
            }
            .run(),
        );

        Self {
            outbound,
            running,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }
}

impl ControlChannel for TcpTrackerChannel {
    fn send(&self, envelope: ControlEnvelope) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.outbound.send(envelope).is_ok()
    }

    fn close(&self, timeout: Duration) -> BoxFuture<'_, ()> {
        self.running.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());

        Box::pin(async move {
            if let Some(task) = task {
                let abort = task.abort_handle();
                if tokio::time::timeout(timeout, task).await.is_err() {
                    tracing::warn!("tracker channel did not stop in time, aborting");
                    abort.abort();
                }
            }
        })
    }
}

impl Drop for TcpTrackerChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct ChannelTask {
    local_id: PeerId,
    remote_id: PeerId,
    endpoint: Endpoint,
    queue: mpsc::UnboundedReceiver<ControlEnvelope>,
    inbound: mpsc::UnboundedSender<ControlEnvelope>,
    shutdown: watch::Receiver<bool>,
}

/// Why a connected session ended.
enum SessionEnd {
    Shutdown,
    Disconnected,
}

impl ChannelTask {
    async fn run(mut self) {
        let addr = match self.endpoint.socket_addr() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "unusable tracker endpoint");
                return;
            }
        };

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let stream = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = TcpStream::connect(addr) => result,
            };

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(
                        peer = %self.remote_id.short(),
                        endpoint = %self.endpoint,
                        error = %e,
                        "mailbox unreachable, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.changed() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };

            tracing::debug!(peer = %self.remote_id.short(), endpoint = %self.endpoint, "tracker connected");

            match self.session(stream).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Disconnected => {
                    tracing::debug!(peer = %self.remote_id.short(), "tracker disconnected");
                }
            }
        }

        tracing::debug!(peer = %self.remote_id.short(), "tracker channel stopped");
    }

    async fn session(&mut self, stream: TcpStream) -> SessionEnd {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let greeting = [Bytes::copy_from_slice(self.local_id.as_bytes())];
        if let Err(e) = write_message(&mut writer, &greeting).await {
            tracing::debug!(error = %e, "identity greeting failed");
            return SessionEnd::Disconnected;
        }

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(frames)) => {
                        if frames_tx.send(frames).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "tracker read failed");
                        break;
                    }
                }
            }
        });

        let end = loop {
            tokio::select! {
                _ = self.shutdown.changed() => break SessionEnd::Shutdown,

                envelope = self.queue.recv() => {
                    let Some(envelope) = envelope else {
                        break SessionEnd::Shutdown;
                    };
                    tracing::trace!(
                        peer = %self.remote_id.short(),
                        kind = envelope.message_type().as_str(),
                        id = envelope.id,
                        "sending control message"
                    );
                    let payload = [Bytes::from(envelope.to_bytes())];
                    if let Err(e) = write_message(&mut writer, &payload).await {
                        tracing::warn!(peer = %self.remote_id.short(), error = %e, "tracker send failed");
                        break SessionEnd::Disconnected;
                    }
                }

                frames = frames_rx.recv() => {
                    let Some(frames) = frames else {
                        break SessionEnd::Disconnected;
                    };
                    self.forward_reply(frames);
                }
            }
        };

        read_task.abort();
        end
    }

    fn forward_reply(&self, frames: Vec<Bytes>) {
        let [payload] = frames.as_slice() else {
            tracing::warn!(frames = frames.len(), "unexpected reply frame count, dropping");
            return;
        };

        match ControlEnvelope::from_bytes(payload) {
            Ok(mut envelope) => {
                envelope.sender = Some(self.remote_id.as_bytes().to_vec());
                let _ = self.inbound.send(envelope);
            }
            Err(e) => {
                tracing::warn!(peer = %self.remote_id.short(), error = %e, "undecodable reply, dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use trellis_core::{ControlMessage, FactSet};

    #[tokio::test]
    async fn tcp_channel_greets_then_delivers_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let local = PeerId::generate();
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let channel = TcpTrackerChannel::spawn(
            local,
            PeerId::generate(),
            Endpoint::tcp("127.0.0.1", port),
            inbound_tx,
        );

        assert!(channel.send(ControlEnvelope::new(1, ControlMessage::hello("127.0.0.1", 1))));
        assert!(channel.send(ControlEnvelope::new(
            2,
            ControlMessage::query(FactSet::new().with("name", "echo"))
        )));

        let (mut stream, _) = listener.accept().await.unwrap();
        let greeting = read_message(&mut stream).await.unwrap().unwrap();
        assert_eq!(greeting, vec![Bytes::copy_from_slice(local.as_bytes())]);

        for expected in [1u64, 2] {
            let frames = read_message(&mut stream).await.unwrap().unwrap();
            assert_eq!(frames.len(), 1);
            let envelope = ControlEnvelope::from_bytes(&frames[0]).unwrap();
            assert_eq!(envelope.id, expected);
        }

        channel.close(Duration::from_secs(1)).await;
        assert!(!channel.send(ControlEnvelope::new(3, ControlMessage::hello("x", 1))));
    }

    #[tokio::test]
    async fn replies_are_forwarded_with_remote_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = PeerId::generate();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let channel = TcpTrackerChannel::spawn(
            PeerId::generate(),
            remote,
            Endpoint::tcp("127.0.0.1", port),
            inbound_tx,
        );

        let (mut stream, _) = listener.accept().await.unwrap();
        let _greeting = read_message(&mut stream).await.unwrap();

        let reply = ControlEnvelope::new(9, ControlMessage::response(["tcp://10.0.0.1:5000"]));
        write_message(&mut stream, &[Bytes::from(reply.to_bytes())])
            .await
            .unwrap();

        let forwarded = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.id, 9);
        assert_eq!(forwarded.sender.as_deref(), Some(&remote.as_bytes()[..]));

        channel.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn close_is_bounded_while_unreachable() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (inbound_tx, _rx) = mpsc::unbounded_channel();
        let channel = TcpTrackerChannel::spawn(
            PeerId::generate(),
            PeerId::generate(),
            Endpoint::tcp("127.0.0.1", port),
            inbound_tx,
        );

        let started = Instant::now();
        channel.close(Duration::from_millis(500)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
