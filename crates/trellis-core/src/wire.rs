//! Beacon wire format — the UDP datagram a node broadcasts to announce itself.
//!
//! A beacon is `b"RBY" || BeaconMessage` where BeaconMessage is a protobuf
//! record carrying the 16-byte peer id and the mailbox port. The payload
//! carries no IP address: receivers combine the declared port with the
//! datagram's source address. Changing the magic or the field tags breaks
//! interoperability with every deployed node.

use std::fmt;
use std::net::IpAddr;

use prost::Message;

use crate::endpoint::Endpoint;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Fixed prefix that lets a receiver reject foreign traffic without parsing.
pub const BEACON_MAGIC: [u8; 3] = *b"RBY";

/// Default UDP port beacons are broadcast to and received on.
pub const DEFAULT_BROADCAST_PORT: u16 = 8520;

/// Default interval between two beacons, in seconds.
pub const DEFAULT_BROADCAST_INTERVAL_SECS: u64 = 30;

/// Receive buffer size for beacon datagrams.
pub const MAX_BEACON_SIZE: usize = 1024;

// ── Peer ID ───────────────────────────────────────────────────────────────────

/// 128-bit node identity, generated once per process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub const LEN: usize = 16;

    /// Random version 4 UUID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns None unless `bytes` is exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

// ── Beacon ────────────────────────────────────────────────────────────────────

/// Protobuf payload following the magic.
#[derive(Clone, PartialEq, Message)]
pub struct BeaconMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub peer_id: Vec<u8>,

    #[prost(int32, tag = "2")]
    pub peer_mailbox_port: i32,
}

/// A decoded beacon: who sent it and where its mailbox listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub peer_id: PeerId,
    pub endpoint: Endpoint,
}

/// Encode a beacon for `peer_id` whose mailbox listens on `mailbox_port`.
pub fn encode_beacon(peer_id: &PeerId, mailbox_port: u16) -> Vec<u8> {
    let payload = BeaconMessage {
        peer_id: peer_id.as_bytes().to_vec(),
        peer_mailbox_port: i32::from(mailbox_port),
    }
    .encode_to_vec();

    let mut datagram = Vec::with_capacity(BEACON_MAGIC.len() + payload.len());
    datagram.extend_from_slice(&BEACON_MAGIC);
    datagram.extend_from_slice(&payload);
    datagram
}

/// Decode a beacon datagram received from `source`.
///
/// The endpoint is built from the datagram's source IP and the declared
/// mailbox port.
pub fn decode_beacon(bytes: &[u8], source: IpAddr) -> Result<Beacon, WireError> {
    if bytes.len() <= BEACON_MAGIC.len() || bytes[..BEACON_MAGIC.len()] != BEACON_MAGIC {
        return Err(WireError::BadMagic);
    }

    let message = BeaconMessage::decode(&bytes[BEACON_MAGIC.len()..])
        .map_err(|e| WireError::Malformed(e.to_string()))?;

    let peer_id = PeerId::from_slice(&message.peer_id)
        .ok_or(WireError::BadPeerId(message.peer_id.len()))?;

    let port = u16::try_from(message.peer_mailbox_port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(WireError::BadPort(message.peer_mailbox_port))?;

    Ok(Beacon {
        peer_id,
        endpoint: Endpoint::tcp(source.to_string(), port),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram does not start with the beacon magic")]
    BadMagic,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("peer id must be 16 bytes, got {0}")]
    BadPeerId(usize),

    #[error("invalid mailbox port: {0}")]
    BadPort(i32),

    #[error("unknown control message type: {0}")]
    UnknownMessageType(i32),

    #[error("correlation id longer than 8 bytes: {0}")]
    BadCorrelationId(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
