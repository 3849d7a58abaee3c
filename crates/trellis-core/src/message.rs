//! Control messages exchanged between nodes.
//!
//! Every control message travels inside a [`ControlEnvelope`] carrying a
//! correlation id, a routing token and, for replies, the identity of the peer
//! the reply is addressed to. Field tags are fixed; reordering them breaks
//! interoperability.

use prost::Message;

use crate::facts::FactSet;
use crate::wire::WireError;

/// Token that routes Responses to the service-query handler.
pub const QUERY_SERVICE_TOKEN: &str = "query-service-token";

/// Key of every pair in a ResponseMessage; the value is an endpoint string.
pub const SERVICE_ENDPOINT_FACT: &str = "service-endpoint";

/// Identifier linking a Query to its Responses.
pub type CorrelationId = u64;

// ── Protobuf records ──────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct KeyValuePair {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct HelloMessage {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(int32, tag = "2")]
    pub port: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct AnnounceMessage {
    #[prost(message, repeated, tag = "1")]
    pub facts: Vec<KeyValuePair>,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryMessage {
    #[prost(message, repeated, tag = "1")]
    pub facts: Vec<KeyValuePair>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResponseMessage {
    #[prost(message, repeated, tag = "1")]
    pub responses: Vec<KeyValuePair>,
}

/// Raw envelope as it appears on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct RawEnvelope {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub message: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub sender: Option<Vec<u8>>,
    #[prost(string, tag = "5")]
    pub token: String,
}

// ── Message type ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Hello = 1,
    Announce = 2,
    Query = 3,
    Response = 4,
}

impl MessageType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Hello),
            2 => Some(Self::Announce),
            3 => Some(Self::Query),
            4 => Some(Self::Response),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Announce => "announce",
            Self::Query => "query",
            Self::Response => "response",
        }
    }
}

impl TryFrom<i32> for MessageType {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_i32(value).ok_or(WireError::UnknownMessageType(value))
    }
}

// ── Typed control messages ────────────────────────────────────────────────────

/// A control message with its decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// "I exist, my mailbox is at address:port."
    Hello { address: String, port: u16 },
    /// Publish the facts of a service hosted at the sender's endpoint.
    Announce { facts: FactSet },
    /// Ask who hosts services matching `facts`.
    Query { facts: FactSet },
    /// Endpoint strings answering a Query. Not validated here.
    Response { endpoints: Vec<String> },
}

impl ControlMessage {
    pub fn hello(address: impl Into<String>, port: u16) -> Self {
        Self::Hello {
            address: address.into(),
            port,
        }
    }

    pub fn announce(facts: FactSet) -> Self {
        Self::Announce { facts }
    }

    pub fn query(facts: FactSet) -> Self {
        Self::Query { facts }
    }

    pub fn response<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Response {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hello { .. } => MessageType::Hello,
            Self::Announce { .. } => MessageType::Announce,
            Self::Query { .. } => MessageType::Query,
            Self::Response { .. } => MessageType::Response,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Hello { address, port } => HelloMessage {
                address: address.clone(),
                port: i32::from(*port),
            }
            .encode_to_vec(),
            Self::Announce { facts } => AnnounceMessage {
                facts: facts.to_pairs(),
            }
            .encode_to_vec(),
            Self::Query { facts } => QueryMessage {
                facts: facts.to_pairs(),
            }
            .encode_to_vec(),
            Self::Response { endpoints } => ResponseMessage {
                responses: endpoints
                    .iter()
                    .map(|e| KeyValuePair {
                        key: SERVICE_ENDPOINT_FACT.to_string(),
                        value: e.clone(),
                    })
                    .collect(),
            }
            .encode_to_vec(),
        }
    }

    fn decode_payload(kind: MessageType, bytes: &[u8]) -> Result<Self, WireError> {
        let malformed = |e: prost::DecodeError| WireError::Malformed(e.to_string());
        Ok(match kind {
            MessageType::Hello => {
                let hello = HelloMessage::decode(bytes).map_err(malformed)?;
                let port = u16::try_from(hello.port)
                    .map_err(|_| WireError::BadPort(hello.port))?;
                Self::Hello {
                    address: hello.address,
                    port,
                }
            }
            MessageType::Announce => {
                let announce = AnnounceMessage::decode(bytes).map_err(malformed)?;
                Self::Announce {
                    facts: FactSet::from_pairs(&announce.facts),
                }
            }
            MessageType::Query => {
                let query = QueryMessage::decode(bytes).map_err(malformed)?;
                Self::Query {
                    facts: FactSet::from_pairs(&query.facts),
                }
            }
            MessageType::Response => {
                let response = ResponseMessage::decode(bytes).map_err(malformed)?;
                Self::Response {
                    endpoints: response.responses.into_iter().map(|p| p.value).collect(),
                }
            }
        })
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A control message plus its routing metadata.
///
/// `sender` present means the envelope is a reply addressed to that peer
/// identity; absent means a new outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEnvelope {
    pub id: CorrelationId,
    pub token: String,
    pub sender: Option<Vec<u8>>,
    pub message: ControlMessage,
}

impl ControlEnvelope {
    pub fn new(id: CorrelationId, message: ControlMessage) -> Self {
        Self {
            id,
            token: String::new(),
            sender: None,
            message,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<Vec<u8>>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    pub fn is_reply(&self) -> bool {
        self.sender.is_some()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        RawEnvelope {
            id: self.id.to_be_bytes().to_vec(),
            r#type: self.message_type() as i32,
            message: self.message.encode_payload(),
            sender: self.sender.clone(),
            token: self.token.clone(),
        }
        .encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let raw = RawEnvelope::decode(bytes).map_err(|e| WireError::Malformed(e.to_string()))?;
        let kind = MessageType::try_from(raw.r#type)?;
        let id = decode_correlation_id(&raw.id)?;
        let message = ControlMessage::decode_payload(kind, &raw.message)?;
        Ok(Self {
            id,
            token: raw.token,
            sender: raw.sender,
            message,
        })
    }
}

/// Big-endian, 0 to 8 bytes. Shorter ids are left-padded.
fn decode_correlation_id(bytes: &[u8]) -> Result<CorrelationId, WireError> {
    if bytes.len() > 8 {
        return Err(WireError::BadCorrelationId(bytes.len()));
    }
    let mut buf = [0u8; 8];
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_envelope_survives_the_wire() {
        let facts = FactSet::new().with("name", "echo").with("version", "1");
        let envelope = ControlEnvelope::new(42, ControlMessage::query(facts.clone()))
            .with_token(QUERY_SERVICE_TOKEN);

        let decoded = ControlEnvelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.token, QUERY_SERVICE_TOKEN);
        assert!(!decoded.is_reply());
        assert_eq!(decoded.message, ControlMessage::Query { facts });
    }

    #[test]
    fn reply_keeps_sender_identity() {
        let envelope = ControlEnvelope::new(
            7,
            ControlMessage::response(["tcp://10.0.0.1:49152"]),
        )
        .with_sender(vec![0xAB; 16]);

        let decoded = ControlEnvelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert!(decoded.is_reply());
        assert_eq!(decoded.sender.as_deref(), Some(&[0xAB; 16][..]));
        assert_eq!(decoded.message_type(), MessageType::Response);
    }

    #[test]
    fn response_pairs_use_service_endpoint_key() {
        let envelope = ControlEnvelope::new(1, ControlMessage::response(["tcp://a:1", "tcp://b:2"]));
        let raw = RawEnvelope::decode(envelope.to_bytes().as_slice()).unwrap();
        let response = ResponseMessage::decode(raw.message.as_slice()).unwrap();
        assert_eq!(response.responses.len(), 2);
        assert!(response.responses.iter().all(|p| p.key == SERVICE_ENDPOINT_FACT));
        assert_eq!(raw.id.len(), 8);
    }

    #[test]
    fn hello_carries_address_and_port() {
        let envelope = ControlEnvelope::new(0, ControlMessage::hello("10.0.0.9", 49153));
        let decoded = ControlEnvelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(decoded.message, ControlMessage::hello("10.0.0.9", 49153));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = RawEnvelope {
            id: vec![1],
            r#type: 99,
            message: Vec::new(),
            sender: None,
            token: String::new(),
        };
        assert_eq!(
            ControlEnvelope::from_bytes(&raw.encode_to_vec()),
            Err(WireError::UnknownMessageType(99))
        );
    }

    #[test]
    fn short_correlation_ids_are_accepted() {
        assert_eq!(decode_correlation_id(&[0x01, 0x00]).unwrap(), 256);
        assert_eq!(decode_correlation_id(&[]).unwrap(), 0);
        assert_eq!(
            decode_correlation_id(&[0; 9]),
            Err(WireError::BadCorrelationId(9))
        );
    }

    #[test]
    fn message_type_codes_are_stable() {
        assert_eq!(MessageType::Hello as i32, 1);
        assert_eq!(MessageType::Announce as i32, 2);
        assert_eq!(MessageType::Query as i32, 3);
        assert_eq!(MessageType::Response as i32, 4);
        assert!(MessageType::try_from(0).is_err());
    }
}
