//! Engine connection loss and recovery.
//!
//! The Kurento stub is killed and restarted on the same port while the
//! relay is serving clients.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

mod common;

use std::time::Duration;

use common::TestRelay;
use relay_service::engine::EngineStatus;
use relay_test_utils::{MockEngine, TEST_SDP_OFFER};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_engine_loss_ends_streaming_session() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();

    engine.drop_all_connections();

    let reply = client.recv_until("error").await.unwrap();
    assert!(reply["message"]
        .as_str()
        .unwrap()
        .starts_with("Failed to get media engine connection"));
    assert!(relay.wait_for_sessions(0, WAIT).await);

    // Pipeline ids died with the connection; nothing is released against
    // whatever connection comes next.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.release_count(), 0);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_engine_loss_with_many_sessions_starts_one_reconnect_loop() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = relay.client().await;
        client.start(TEST_SDP_OFFER).await.unwrap();
        client.recv_until("startResponse").await.unwrap();
        clients.push(client);
    }
    assert_eq!(relay.session_count().await, 3);
    assert_eq!(engine.connections_accepted(), 1);

    engine.drop_all_connections();

    for client in &mut clients {
        let reply = client.recv_until("error").await.unwrap();
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .starts_with("Failed to get media engine connection"));
    }
    assert!(relay.wait_for_sessions(0, WAIT).await);

    // The single loop brings the connection back for new sessions
    assert!(engine.wait_for_connections(2, WAIT).await);
    assert!(relay.wait_for_engine(EngineStatus::Connected, WAIT).await);
    assert_eq!(relay.engine_client.reconnect_loops_started(), 1);
    assert_eq!(engine.connections_accepted(), 2);

    let client = &mut clients[0];
    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    relay.shutdown().await;
}

#[tokio::test]
async fn test_stop_during_dial_leaves_engine_disconnected() {
    // Reserve a port, then free it so nothing listens there
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let relay = TestRelay::start_with(
        &format!("ws://{addr}/kurento"),
        &[
            ("ENGINE_CONNECT_RETRIES", "5"),
            ("ENGINE_CONNECT_RETRY_DELAY_MS", "1000"),
        ],
    )
    .await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    assert!(relay.wait_for_engine(EngineStatus::Connecting, WAIT).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.stop().await.unwrap();
    client.recv_until("stopResponse").await.unwrap();
    assert!(relay.wait_for_sessions(0, WAIT).await);

    assert!(relay.wait_for_engine(EngineStatus::Disconnected, WAIT).await);
    // Nothing is left dialing in the background
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(relay.engine_client.status(), EngineStatus::Disconnected);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_to_restarted_engine() {
    let engine = MockEngine::start().await.unwrap();
    let addr = engine.addr();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    assert_eq!(relay.engine_client.status(), EngineStatus::Connected);

    engine.shutdown().await;
    client.recv_until("error").await.unwrap();
    assert!(relay.wait_for_engine(EngineStatus::Disconnected, WAIT).await);

    let restarted = MockEngine::builder().start_on(addr).await.unwrap();
    assert!(relay.wait_for_engine(EngineStatus::Connected, WAIT).await);
    assert_eq!(restarted.connections_accepted(), 1);
    assert_eq!(relay.engine_client.reconnect_loops_started(), 1);

    // New sessions run on the new connection without redialing
    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    assert_eq!(restarted.connections_accepted(), 1);
    assert_eq!(restarted.count("MediaPipeline"), 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_loop_retries_until_engine_returns() {
    let engine = MockEngine::start().await.unwrap();
    let addr = engine.addr();
    let relay = TestRelay::start(&engine.url()).await;

    relay.engine_client.get_connection().await.unwrap();
    engine.shutdown().await;
    assert!(relay.wait_for_engine(EngineStatus::Disconnected, WAIT).await);

    // Let a couple of attempts fail against the closed port
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_ne!(relay.engine_client.status(), EngineStatus::Connected);

    let restarted = MockEngine::builder().start_on(addr).await.unwrap();
    assert!(relay.wait_for_engine(EngineStatus::Connected, WAIT).await);
    assert_eq!(relay.engine_client.reconnect_loops_started(), 1);
    assert_eq!(restarted.connections_accepted(), 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let engine = MockEngine::start().await.unwrap();
    let addr = engine.addr();
    let relay =
        TestRelay::start_with(&engine.url(), &[("ENGINE_RECONNECT_MAX_ATTEMPTS", "1")]).await;

    relay.engine_client.get_connection().await.unwrap();
    engine.shutdown().await;
    assert!(relay.wait_for_engine(EngineStatus::Disconnected, WAIT).await);

    // The single attempt fires after one interval and fails
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let restarted = MockEngine::builder().start_on(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(restarted.connections_accepted(), 0);
    assert_eq!(relay.engine_client.status(), EngineStatus::Disconnected);

    // An explicit request still dials on demand
    let mut client = relay.client().await;
    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    assert_eq!(restarted.connections_accepted(), 1);

    relay.shutdown().await;
}
