//! Routes incoming control envelopes to the component that handles them.

use std::sync::Arc;

use trellis_core::{ControlEnvelope, ControlMessage, FactSet, PeerId};

use crate::channel::MessageChannel;
use crate::directory::{ServiceDirectory, ServiceEndpoint};
use crate::discovery::DiscoveryEngine;

/// Dispatches control envelopes by message type.
#[derive(Clone)]
pub struct ControlDispatcher {
    engine: DiscoveryEngine,
    directory: ServiceDirectory,
    channel: Arc<MessageChannel>,
}

impl ControlDispatcher {
    pub fn new(
        engine: DiscoveryEngine,
        directory: ServiceDirectory,
        channel: Arc<MessageChannel>,
    ) -> Self {
        Self {
            engine,
            directory,
            channel,
        }
    }

    pub async fn dispatch(&self, envelope: ControlEnvelope) {
        match &envelope.message {
            ControlMessage::Hello { address, port } => {
                let Some(sender) = envelope.sender.as_deref() else {
                    tracing::warn!("hello without sender identity, dropping");
                    return;
                };
                self.engine.on_hello(sender, address, *port).await;
            }
            ControlMessage::Announce { facts } => self.on_announce(&envelope, facts),
            ControlMessage::Query { facts } => self.on_query(&envelope, facts).await,
            ControlMessage::Response { .. } => self.engine.on_response(&envelope),
        }
    }

    /// Record the announced service at the sending tracker's endpoint.
    fn on_announce(&self, envelope: &ControlEnvelope, facts: &FactSet) {
        let tracker = envelope
            .sender
            .as_deref()
            .and_then(PeerId::from_slice)
            .and_then(|peer| self.engine.tracker(&peer));

        let Some(tracker) = tracker else {
            tracing::warn!(
                sender = %envelope.sender.as_deref().map(hex::encode).unwrap_or_default(),
                "announce from unknown tracker, dropping"
            );
            return;
        };

        let endpoint = tracker.endpoint().clone();
        tracing::debug!(peer = %tracker.peer_id().short(), endpoint = %endpoint, facts = facts.len(), "service announced");
        self.directory
            .add(ServiceEndpoint::new(endpoint, facts.clone()));
    }

    /// Answer from the local directory. Nothing is sent when nothing matches.
    async fn on_query(&self, envelope: &ControlEnvelope, facts: &FactSet) {
        let Some(sender) = envelope.sender.clone() else {
            tracing::warn!(id = envelope.id, "query without sender identity, dropping");
            return;
        };

        let found = self.directory.query(facts);
        if found.is_empty() {
            tracing::trace!(id = envelope.id, "no local match for query");
            return;
        }

        let reply = ControlEnvelope::new(
            envelope.id,
            ControlMessage::response(found.iter().map(ToString::to_string)),
        )
        .with_token(envelope.token.clone())
        .with_sender(sender);

        match self.channel.send(reply).await {
            Ok(true) => tracing::debug!(id = envelope.id, matches = found.len(), "query answered"),
            Ok(false) => tracing::debug!(id = envelope.id, "querying peer unreachable"),
            Err(e) => tracing::warn!(id = envelope.id, error = %e, "query reply failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use futures::future::BoxFuture;
    use tokio::net::TcpStream;
    use trellis_core::message::QUERY_SERVICE_TOKEN;
    use trellis_core::{Beacon, Endpoint};

    use crate::discovery::{DiscoveryOptions, QueryCallback};
    use crate::frame::{read_message, write_message};
    use crate::tracker::{ControlChannel, TrackerConnector};

    struct NullChannel;

    impl ControlChannel for NullChannel {
        fn send(&self, _envelope: ControlEnvelope) -> bool {
            true
        }

        fn close(&self, _timeout: Duration) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    struct NullConnector;

    impl TrackerConnector for NullConnector {
        fn connect(&self, _peer_id: PeerId, _endpoint: &Endpoint) -> Arc<dyn ControlChannel> {
            Arc::new(NullChannel)
        }
    }

    async fn fixture() -> (ControlDispatcher, DiscoveryEngine, ServiceDirectory, Arc<MessageChannel>, Endpoint) {
        let directory = ServiceDirectory::new();
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let engine = DiscoveryEngine::new(
            PeerId::generate(),
            directory.clone(),
            Arc::new(NullConnector),
            DiscoveryOptions {
                broadcast_port: port,
                active_broadcast: false,
                ..DiscoveryOptions::default()
            },
        );
        let channel = Arc::new(MessageChannel::new(Endpoint::tcp("127.0.0.1", 0)));
        let mailbox = channel.open().await.unwrap();
        engine.start(&mailbox).unwrap();
        let dispatcher = ControlDispatcher::new(engine.clone(), directory.clone(), channel.clone());
        (dispatcher, engine, directory, channel, mailbox)
    }

    #[tokio::test]
    async fn announce_from_known_tracker_updates_directory() {
        let (dispatcher, engine, directory, channel, _) = fixture().await;
        let peer = PeerId::generate();
        engine
            .on_beacon(Beacon {
                peer_id: peer,
                endpoint: Endpoint::tcp("10.0.0.4", 50500),
            })
            .await;

        let announce = ControlEnvelope::new(1, ControlMessage::announce(FactSet::new().with("name", "echo")))
            .with_sender(peer.as_bytes().to_vec());
        dispatcher.dispatch(announce).await;

        assert_eq!(
            directory.query(&FactSet::new().with("name", "echo")),
            vec![Endpoint::tcp("10.0.0.4", 50500)]
        );
        channel.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn announce_from_unknown_sender_is_dropped() {
        let (dispatcher, _, directory, channel, _) = fixture().await;
        let announce = ControlEnvelope::new(1, ControlMessage::announce(FactSet::new().with("name", "echo")))
            .with_sender(PeerId::generate().as_bytes().to_vec());
        dispatcher.dispatch(announce).await;
        assert!(directory.is_empty());
        channel.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn hello_registers_tracker() {
        let (dispatcher, engine, _, channel, _) = fixture().await;
        let peer = PeerId::generate();
        let hello = ControlEnvelope::new(1, ControlMessage::hello("10.0.0.8", 50800))
            .with_sender(peer.as_bytes().to_vec());
        dispatcher.dispatch(hello).await;
        assert_eq!(
            engine.tracker(&peer).unwrap().endpoint(),
            &Endpoint::tcp("10.0.0.8", 50800)
        );
        channel.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn query_with_local_match_is_answered_over_the_mailbox() {
        let (dispatcher, _, directory, channel, mailbox) = fixture().await;
        directory.add(ServiceEndpoint::new(
            Endpoint::tcp("10.0.0.1", 51000),
            FactSet::new().with("name", "echo").with("version", "1"),
        ));
        let mut events = channel.add_listener();

        let peer = PeerId::generate();
        let mut stream = TcpStream::connect(mailbox.socket_addr().unwrap()).await.unwrap();
        write_message(&mut stream, &[Bytes::copy_from_slice(peer.as_bytes())])
            .await
            .unwrap();
        let query = ControlEnvelope::new(77, ControlMessage::query(FactSet::new().with("name", "echo")))
            .with_token(QUERY_SERVICE_TOKEN);
        write_message(&mut stream, &[Bytes::from(query.to_bytes())])
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let crate::channel::ChannelEvent::Received(received) = event else {
            panic!("expected received event");
        };
        dispatcher.dispatch(received).await;

        let frames = read_message(&mut stream).await.unwrap().unwrap();
        let reply = ControlEnvelope::from_bytes(&frames[0]).unwrap();
        assert_eq!(reply.id, 77);
        assert_eq!(reply.token, QUERY_SERVICE_TOKEN);
        assert_eq!(
            reply.message,
            ControlMessage::response(["tcp://10.0.0.1:51000"])
        );
        channel.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn response_resolves_pending_query() {
        let (dispatcher, engine, _, channel, _) = fixture().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: QueryCallback = Arc::new(move |e| sink.lock().unwrap().push(e));
        let id = engine
            .find_services(&FactSet::new().with("name", "echo"), callback)
            .correlation_id()
            .unwrap();

        let response = ControlEnvelope::new(id, ControlMessage::response(["tcp://10.0.0.2:52000"]))
            .with_token(QUERY_SERVICE_TOKEN);
        dispatcher.dispatch(response).await;

        assert_eq!(*seen.lock().unwrap(), vec![Endpoint::tcp("10.0.0.2", 52000)]);
        channel.close(Duration::from_secs(1)).await;
    }
}
