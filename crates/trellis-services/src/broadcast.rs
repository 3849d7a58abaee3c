//! Beacon broadcaster and listener.
//!
//! The send loop emits one beacon immediately and then every `interval` to
//! `255.255.255.255:port`. The receive loop decodes datagrams arriving on
//! `port` and forwards valid beacons. Both loops stop on [`Broadcaster::stop`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use trellis_core::wire::{decode_beacon, encode_beacon, Beacon, PeerId, MAX_BEACON_SIZE};

pub struct Broadcaster {
    interval: Duration,
    port: u16,
    destination: IpAddr,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(interval: Duration, port: u16) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            interval,
            port,
            destination: IpAddr::V4(Ipv4Addr::BROADCAST),
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Send beacons to `destination` instead of the limited broadcast address.
    pub fn with_destination(mut self, destination: IpAddr) -> Self {
        self.destination = destination;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind the broadcast port and spawn the receive loop. Decoded beacons
    /// are pushed to `events`.
    pub fn listen(&self, events: mpsc::Sender<Beacon>) -> std::io::Result<()> {
        let socket = UdpSocket::from_std(make_udp_socket(self.port)?)?;
        self.running.store(true, Ordering::Release);

        tracing::info!(port = self.port, "beacon listener starting");

        let task = tokio::spawn(receive_loop(
            socket,
            events,
            self.shutdown.subscribe(),
            self.running.clone(),
        ));
        self.track(task);
        Ok(())
    }

    /// Spawn the send loop announcing `peer_id` with its mailbox port.
    pub fn broadcast(&self, peer_id: PeerId, mailbox_port: u16) -> std::io::Result<()> {
        let socket = UdpSocket::from_std(make_udp_socket(0)?)?;
        self.running.store(true, Ordering::Release);

        let destination = SocketAddr::new(self.destination, self.port);
        tracing::info!(
            peer = %peer_id.short(),
            mailbox_port,
            destination = %destination,
            interval_secs = self.interval.as_secs(),
            "beacon broadcast starting"
        );

        let task = tokio::spawn(send_loop(
            socket,
            destination,
            encode_beacon(&peer_id, mailbox_port),
            self.interval,
            self.shutdown.subscribe(),
        ));
        self.track(task);
        Ok(())
    }

    /// Signal both loops to exit. Safe to call more than once.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!(port = self.port, "broadcaster stopping");
        }
        self.shutdown.send_replace(true);
    }

    /// Wait up to `timeout` for the loops to finish, aborting stragglers.
    pub async fn join(&self, timeout: Duration) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                abort.abort();
            }
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn receive_loop(
    socket: UdpSocket,
    events: mpsc::Sender<Beacon>,
    mut shutdown: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_BEACON_SIZE];

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,

            result = socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        if !running.load(Ordering::Acquire) {
                            break;
                        }
                        tracing::warn!(error = %e, "beacon recv_from failed");
                        continue;
                    }
                };

                match decode_beacon(&buf[..len], from.ip()) {
                    Ok(beacon) => {
                        tracing::debug!(
                            peer = %beacon.peer_id.short(),
                            endpoint = %beacon.endpoint,
                            "beacon received"
                        );
                        if events.send(beacon).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(from = %from, error = %e, "ignoring datagram");
                    }
                }
            }
        }
    }

    tracing::debug!("beacon listener stopped");
}

async fn send_loop(
    socket: UdpSocket,
    destination: SocketAddr,
    datagram: Vec<u8>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,

            _ = ticker.tick() => {
                match socket.send_to(&datagram, destination).await {
                    Ok(n) if n < datagram.len() => {
                        tracing::warn!(sent = n, expected = datagram.len(), "short beacon send");
                    }
                    Ok(n) => tracing::trace!(bytes = n, "beacon sent"),
                    Err(e) => tracing::warn!(error = %e, "beacon send failed"),
                }
            }
        }
    }

    tracing::debug!("beacon broadcast stopped");
}

/// Create a non-blocking IPv4 UDP socket that may broadcast, bound to `port`
/// on every interface.
fn make_udp_socket(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())?;

    Ok(socket.into())
}
