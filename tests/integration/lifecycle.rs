use crate::*;

use trellis_services::ChannelState;

/// Shutdown finishes within its bound even when the peer it tracks has
/// already gone away and its tracker is stuck reconnecting.
#[tokio::test]
async fn test_shutdown_bounded_with_dead_peer() {
    let node_a = spawn_node(&[]).await.unwrap();
    let node_b = spawn_node(&[]).await.unwrap();
    introduce(&node_a, &node_b).await.unwrap();

    node_b.shutdown(SHUTDOWN).await;
    // Queue traffic for the dead peer.
    node_a.announce_local(echo_service());

    let start = Instant::now();
    node_a.shutdown(Duration::from_millis(500)).await;
    assert!(
        start.elapsed() < Duration::from_secs(3),
        "shutdown took {:?}",
        start.elapsed()
    );
    assert_eq!(node_a.channel().state(), ChannelState::Closed);
    assert_eq!(node_a.engine().tracker_count(), 0);
}

/// Once a node's mailbox is closed nothing can connect to it.
#[tokio::test]
async fn test_mailbox_refuses_after_shutdown() {
    let node = spawn_node(&[]).await.unwrap();
    let endpoint = node.endpoint().unwrap();
    node.shutdown(SHUTDOWN).await;

    let addr = endpoint.socket_addr().unwrap();
    let connect = tokio::time::timeout(
        Duration::from_secs(1),
        tokio::net::TcpStream::connect(addr),
    )
    .await;
    assert!(!matches!(connect, Ok(Ok(_))), "mailbox still accepting");
}

/// A service hosted after peers are known is pushed to all of them.
#[tokio::test]
async fn test_late_announce_reaches_every_peer() {
    let host = spawn_node(&[]).await.unwrap();
    let peer_1 = spawn_node(&[]).await.unwrap();
    let peer_2 = spawn_node(&[]).await.unwrap();

    introduce(&host, &peer_1).await.unwrap();
    introduce(&host, &peer_2).await.unwrap();

    let reached = host.announce_local(echo_service());
    assert_eq!(reached, 2);

    let expected = host.endpoint().unwrap();
    wait_for(Duration::from_secs(5), || {
        peer_1.directory().query(&echo_service()) == vec![expected.clone()]
            && peer_2.directory().query(&echo_service()) == vec![expected.clone()]
    })
    .await
    .expect("announcement did not reach both peers");

    for node in [host, peer_1, peer_2] {
        node.shutdown(SHUTDOWN).await;
    }
}
