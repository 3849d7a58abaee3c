use crate::*;

/// A discovers B by beacon; its Hello makes B register A in return.
#[tokio::test]
async fn test_hello_registers_both_sides() {
    let node_a = spawn_node(&[]).await.unwrap();
    let node_b = spawn_node(&[]).await.unwrap();

    introduce(&node_a, &node_b).await.unwrap();
    assert_eq!(node_a.engine().tracker_count(), 1);

    wait_for(Duration::from_secs(5), || {
        node_b.engine().tracker(&node_a.peer_id()).is_some()
    })
    .await
    .expect("B never registered A");

    let tracker = node_b.engine().tracker(&node_a.peer_id()).unwrap();
    assert_eq!(Some(tracker.endpoint().clone()), node_a.endpoint());
    // B learned about A from the Hello alone; A still has exactly one tracker.
    assert_eq!(node_a.engine().tracker_count(), 1);

    node_a.shutdown(SHUTDOWN).await;
    node_b.shutdown(SHUTDOWN).await;
}

/// Hosted services travel to a peer as soon as it is discovered.
#[tokio::test]
async fn test_hosted_services_announced_on_discovery() {
    let node_a = spawn_node(&[]).await.unwrap();
    let node_b = spawn_node(&[echo_service()]).await.unwrap();

    introduce(&node_a, &node_b).await.unwrap();

    let expected = node_b.endpoint().unwrap();
    wait_for(Duration::from_secs(5), || {
        node_a.directory().query(&echo_service()) == vec![expected.clone()]
    })
    .await
    .expect("A never learned B's service");

    node_a.shutdown(SHUTDOWN).await;
    node_b.shutdown(SHUTDOWN).await;
}

/// Repeated beacons from the same peer do not create extra trackers.
#[tokio::test]
async fn test_repeated_beacons_keep_one_tracker() {
    let node_a = spawn_node(&[]).await.unwrap();
    let node_b = spawn_node(&[]).await.unwrap();

    for _ in 0..3 {
        introduce(&node_a, &node_b).await.unwrap();
    }
    assert_eq!(node_a.engine().tracker_count(), 1);

    node_a.shutdown(SHUTDOWN).await;
    node_b.shutdown(SHUTDOWN).await;
}

/// A node never tracks itself, even when its own beacon comes back.
#[tokio::test]
async fn test_own_beacon_ignored() {
    let node = spawn_node(&[]).await.unwrap();
    introduce(&node, &node).await.unwrap();
    assert_eq!(node.engine().tracker_count(), 0);
    node.shutdown(SHUTDOWN).await;
}
