//! trellis-core — identifiers, endpoints, wire formats and configuration.
//! All other Trellis crates depend on this one.

pub mod config;
pub mod endpoint;
pub mod facts;
pub mod message;
pub mod wire;

pub use endpoint::{Endpoint, Transport};
pub use facts::FactSet;
pub use message::{ControlEnvelope, ControlMessage, CorrelationId, MessageType};
pub use wire::{Beacon, PeerId};
