//! trellis-services — the runtime side of Trellis: beacons, trackers,
//! the discovery engine, the mailbox channel and the node that wires them.

pub mod broadcast;
pub mod channel;
pub mod directory;
pub mod discovery;
pub mod dispatch;
pub mod frame;
pub mod node;
pub mod tracker;

pub use broadcast::Broadcaster;
pub use channel::{ChannelError, ChannelEvent, ChannelState, MessageChannel};
pub use directory::{ServiceDirectory, ServiceEndpoint};
pub use discovery::{DiscoveryEngine, DiscoveryError, DiscoveryOptions, FindOutcome, QueryCallback};
pub use dispatch::ControlDispatcher;
pub use node::{Node, NodeError};
pub use tracker::{ControlChannel, TcpConnector, TcpTrackerChannel, Tracker, TrackerConnector};
