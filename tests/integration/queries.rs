use crate::*;

use trellis_core::message::QUERY_SERVICE_TOKEN;
use trellis_core::{ControlEnvelope, ControlMessage};
use trellis_services::FindOutcome;

/// A query issued before any peer is known is sent once the first tracker
/// appears, and the answer reaches the original callback.
#[tokio::test]
async fn test_queued_query_answered_after_discovery() {
    let node_a = spawn_node(&[]).await.unwrap();
    let node_b = spawn_node(&[echo_service()]).await.unwrap();

    let (callback, seen) = recorder();
    let outcome = node_a.find_services(&echo_service(), callback);
    assert!(matches!(outcome, FindOutcome::Queued(_)), "got {outcome:?}");
    assert_eq!(node_a.engine().pending_count(), 1);

    introduce(&node_a, &node_b).await.unwrap();
    assert_eq!(node_a.engine().pending_count(), 0);

    let expected = node_b.endpoint().unwrap();
    wait_for(Duration::from_secs(5), || !seen.lock().unwrap().is_empty())
        .await
        .expect("query never answered");
    assert_eq!(*seen.lock().unwrap(), vec![expected]);
    assert_eq!(node_a.engine().in_flight_count(), 0);

    node_a.shutdown(SHUTDOWN).await;
    node_b.shutdown(SHUTDOWN).await;
}

/// Query → Response over real sockets resolves the in-flight entry.
#[tokio::test]
async fn test_query_dispatched_to_tracker_gets_response() {
    let node_a = spawn_node(&[]).await.unwrap();
    let node_b = spawn_node(&[]).await.unwrap();

    introduce(&node_a, &node_b).await.unwrap();
    // B starts hosting after discovery, so only the query path can find it.
    let clock = FactSet::new().with("name", "clock");
    node_b.directory().add(trellis_services::ServiceEndpoint::new(
        node_b.endpoint().unwrap(),
        clock.clone(),
    ));

    let (callback, seen) = recorder();
    let outcome = node_a.find_services(&clock, callback);
    assert!(matches!(outcome, FindOutcome::Dispatched(_)), "got {outcome:?}");

    wait_for(Duration::from_secs(5), || !seen.lock().unwrap().is_empty())
        .await
        .expect("response never arrived");
    assert_eq!(*seen.lock().unwrap(), vec![node_b.endpoint().unwrap()]);

    node_a.shutdown(SHUTDOWN).await;
    node_b.shutdown(SHUTDOWN).await;
}

/// A peer without a match stays silent; the query remains in flight.
#[tokio::test]
async fn test_unmatched_query_gets_no_response() {
    let node_a = spawn_node(&[]).await.unwrap();
    let node_b = spawn_node(&[echo_service()]).await.unwrap();
    introduce(&node_a, &node_b).await.unwrap();

    let (callback, seen) = recorder();
    let outcome = node_a.find_services(&FactSet::new().with("name", "nobody"), callback);
    assert!(matches!(outcome, FindOutcome::Dispatched(_)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(node_a.engine().in_flight_count(), 1);

    node_a.shutdown(SHUTDOWN).await;
    node_b.shutdown(SHUTDOWN).await;
}

/// A local component asks through the mailbox and gets Response envelopes
/// back, one per matching endpoint.
#[tokio::test]
async fn test_local_request_through_mailbox() {
    let node_a = spawn_node(&[]).await.unwrap();
    let node_b = spawn_node(&[echo_service()]).await.unwrap();
    introduce(&node_a, &node_b).await.unwrap();

    let mut responses = node_a.subscribe_responses();
    let request = ControlEnvelope::new(500, ControlMessage::query(echo_service()))
        .with_token(QUERY_SERVICE_TOKEN);
    assert!(node_a.channel().send(request).await.unwrap());

    let response = tokio::time::timeout(Duration::from_secs(5), responses.recv())
        .await
        .expect("no response")
        .unwrap();
    assert_eq!(response.id, 500);
    assert_eq!(
        response.message,
        ControlMessage::response([node_b.endpoint().unwrap().to_string()])
    );

    node_a.shutdown(SHUTDOWN).await;
    node_b.shutdown(SHUTDOWN).await;
}
