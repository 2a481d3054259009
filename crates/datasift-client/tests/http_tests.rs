//! End-to-end tests over real HTTP against `TestUpstream`

use std::time::Duration;

use axum::http::StatusCode;
use datasift_client::testing::{wait_for, TestUpstream};
use datasift_client::{
    ClientError, ClientEvent, ConnectionState, DataSiftClient, StreamState, TransportError,
};
use serde_json::json;
use tokio::sync::broadcast;

const HASH: &str = "0123456789abcdef0123456789abcdef";

async fn next_matching(
    events: &mut broadcast::Receiver<ClientEvent>,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn fast_client(upstream: &TestUpstream) -> DataSiftClient {
    let mut config = upstream.config("testuser", "testkey");
    config.subscribe_wait_ms = 50;
    DataSiftClient::with_config(config).unwrap()
}

#[tokio::test]
async fn test_request_carries_stream_headers() {
    let mut upstream = TestUpstream::start().await.unwrap();
    let client = upstream.client().unwrap();

    client.start().await.unwrap();
    let connection = upstream.next_connection().await.unwrap();

    assert_eq!(connection.header("authorization"), Some("testuser:testkey"));
    assert_eq!(
        connection.header("host"),
        Some(format!("127.0.0.1:{}", upstream.addr.port()).as_str())
    );
    assert!(connection
        .header("user-agent")
        .is_some_and(|ua| ua.starts_with("DataSiftRust/")));
    assert_eq!(client.state(), ConnectionState::Connected);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_and_receive_interactions() {
    let mut upstream = TestUpstream::start().await.unwrap();
    let client = fast_client(&upstream);
    let mut events = client.events();

    let subscriber = client.clone();
    let pending = tokio::spawn(async move { subscriber.subscribe(HASH).await });

    let mut connection = upstream.next_connection().await.unwrap();
    assert_eq!(
        connection.next_command().await,
        Some(json!({"action": "subscribe", "hash": HASH}))
    );

    let outcomes = pending.await.unwrap().unwrap();
    assert_eq!(
        outcomes[0].result.as_ref().map(|s| s.state),
        Ok(StreamState::Subscribed)
    );

    // Record split across two chunks
    connection.send("{\"data\":{\"interaction\":{\"id\":");
    connection.send("\"abc\"}}}\n");

    let event = next_matching(&mut events, |e| matches!(e, ClientEvent::Interaction(_))).await;
    assert_eq!(
        event,
        ClientEvent::Interaction(json!({"data": {"interaction": {"id": "abc"}}}))
    );

    client.shutdown().await.unwrap();
    assert_eq!(
        connection.next_command().await,
        Some(json!({"action": "unsubscribe", "hash": HASH}))
    );
    assert_eq!(connection.next_command().await, Some(json!({"action": "stop"})));
}

#[tokio::test]
async fn test_invalid_credentials_are_fatal() {
    let mut upstream = TestUpstream::start().await.unwrap();
    upstream.respond_with(StatusCode::UNAUTHORIZED).await;
    let client = upstream.client().unwrap();
    let mut events = client.events();

    let outcomes = client.subscribe(HASH).await.unwrap();

    assert!(matches!(
        outcomes[0].result,
        Err(ClientError::Transport(TransportError::Fatal { status: 401, .. }))
    ));
    next_matching(&mut events, |e| matches!(e, ClientEvent::Disconnect)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(upstream.next_connection().await.is_some());

    // No second attempt
    let reconnected = wait_for(
        || async { client.status().reconnect_attempts > 1 },
        Duration::from_millis(200),
    )
    .await;
    assert!(!reconnected);
}

#[tokio::test]
async fn test_server_end_reconnects_and_resends() {
    let mut upstream = TestUpstream::start().await.unwrap();
    let client = fast_client(&upstream);

    let subscriber = client.clone();
    let pending = tokio::spawn(async move { subscriber.subscribe(HASH).await });
    let mut first = upstream.next_connection().await.unwrap();
    first.next_command().await.unwrap();
    assert!(pending.await.unwrap().unwrap()[0].is_ok());

    first.close();

    let mut second = upstream.next_connection().await.unwrap();
    assert_eq!(
        second.next_command().await,
        Some(json!({"action": "subscribe", "hash": HASH}))
    );

    client.shutdown().await.unwrap();
}
