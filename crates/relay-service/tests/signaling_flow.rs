//! End-to-end signaling tests.
//!
//! A browser-side client talks to the real gateway, which drives a Kurento
//! stub over a real WebSocket.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

mod common;

use std::time::Duration;

use common::TestRelay;
use relay_test_utils::{ice_candidate, MockEngine, TEST_RTSP_URL, TEST_SDP_ANSWER, TEST_SDP_OFFER};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Session setup
// ============================================================================

#[tokio::test]
async fn test_start_negotiates_and_answers() {
    let engine = MockEngine::builder()
        .with_candidates(vec![ice_candidate(1), ice_candidate(2)])
        .start()
        .await
        .unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();

    // The answer always precedes any local candidate
    let answer = client.recv().await.unwrap();
    assert_eq!(answer, json!({"id": "startResponse", "sdpAnswer": TEST_SDP_ANSWER}));

    let first = client.recv().await.unwrap();
    let second = client.recv().await.unwrap();
    assert_eq!(first, json!({"id": "iceCandidate", "candidate": ice_candidate(1)}));
    assert_eq!(second, json!({"id": "iceCandidate", "candidate": ice_candidate(2)}));

    assert!(engine.wait_for_count("play", 1, WAIT).await);
    let keys: Vec<String> = engine
        .requests()
        .iter()
        .map(|r| match r["method"].as_str().unwrap() {
            "create" => r["params"]["type"].as_str().unwrap().to_string(),
            "invoke" => r["params"]["operation"].as_str().unwrap().to_string(),
            other => other.to_string(),
        })
        .collect();
    assert_eq!(
        keys,
        vec![
            "MediaPipeline",
            "PlayerEndpoint",
            "WebRtcEndpoint",
            "subscribe",
            "connect",
            "processOffer",
            "gatherCandidates",
            "play",
        ]
    );

    let player = engine
        .requests()
        .into_iter()
        .find(|r| r["params"]["type"] == "PlayerEndpoint")
        .unwrap();
    assert_eq!(player["params"]["constructorParams"]["uri"], TEST_RTSP_URL);

    let offer = engine
        .requests()
        .into_iter()
        .find(|r| r["params"]["operation"] == "processOffer")
        .unwrap();
    assert_eq!(offer["params"]["operationParams"]["offer"], TEST_SDP_OFFER);

    assert_eq!(relay.session_count().await, 1);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_requests_echo_engine_session_id() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    assert!(engine.wait_for_count("play", 1, WAIT).await);

    let requests = engine.requests();
    // The first request is made before the engine assigned a session
    assert!(requests[0]["params"].get("sessionId").is_none());
    assert!(requests[1..]
        .iter()
        .all(|r| r["params"]["sessionId"].is_string()));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_starts_share_one_engine_connection() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(relay.client().await);
    }
    for client in &mut clients {
        client.start(TEST_SDP_OFFER).await.unwrap();
    }
    for client in &mut clients {
        client.recv_until("startResponse").await.unwrap();
    }

    assert_eq!(engine.connections_accepted(), 1);
    assert_eq!(engine.count("MediaPipeline"), 3);
    assert_eq!(relay.session_count().await, 3);
    relay.shutdown().await;
}

// ============================================================================
// ICE relay
// ============================================================================

#[tokio::test]
async fn test_client_candidates_forwarded_in_order() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();

    for n in 1..=5 {
        client.ice_candidate(ice_candidate(n)).await.unwrap();
    }
    assert!(engine.wait_for_count("addIceCandidate", 5, WAIT).await);

    let forwarded = engine.remote_candidates();
    for (n, candidate) in (1..=5).zip(&forwarded) {
        assert_eq!(candidate["candidate"], ice_candidate(n)["candidate"]);
        assert_eq!(candidate["__module__"], "kurento");
        assert_eq!(candidate["__type__"], "IceCandidate");
    }

    // Candidates go to the browser-facing endpoint
    let sink_requests: Vec<_> = engine
        .requests()
        .into_iter()
        .filter(|r| r["params"]["operation"] == "addIceCandidate")
        .collect();
    assert!(sink_requests.iter().all(|r| r["params"]["object"]
        .as_str()
        .unwrap()
        .ends_with("_kurento.WebRtcEndpoint")));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_candidate_before_start_is_rejected() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.ice_candidate(ice_candidate(1)).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(
        reply,
        json!({"id": "error", "message": "No WebRtcEndpoint found for ICE candidate"})
    );
    assert_eq!(engine.count("addIceCandidate"), 0);

    relay.shutdown().await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_stop_releases_pipeline_once() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();

    client.stop().await.unwrap();
    let reply = client.recv_until("stopResponse").await.unwrap();
    assert_eq!(reply["message"], "Session stopped");

    assert!(engine.wait_for_releases(1, WAIT).await);
    assert!(relay.wait_for_sessions(0, WAIT).await);

    // A second stop has nothing to stop
    client.stop().await.unwrap();
    assert!(client
        .try_recv(Duration::from_millis(300))
        .await
        .unwrap()
        .is_none());
    assert_eq!(engine.release_count(), 1);

    assert!(engine.released()[0].ends_with("_kurento.MediaPipeline"));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_restart_after_stop() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    client.stop().await.unwrap();
    client.recv_until("stopResponse").await.unwrap();

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();

    assert_eq!(engine.count("MediaPipeline"), 2);
    assert_eq!(engine.release_count(), 1);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_pipeline() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    client.close().await;

    assert!(engine.wait_for_releases(1, WAIT).await);
    assert!(relay.wait_for_sessions(0, WAIT).await);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_during_setup_still_releases() {
    let engine = MockEngine::builder()
        .delayed("processOffer", Duration::from_millis(300))
        .start()
        .await
        .unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    assert!(engine.wait_for_count("processOffer", 1, WAIT).await);
    client.close().await;

    assert!(engine.wait_for_releases(1, WAIT).await);
    assert!(relay.wait_for_sessions(0, WAIT).await);
    // Setup stopped before the stream was played
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.count("play"), 0);
    assert_eq!(engine.release_count(), 1);
    relay.shutdown().await;
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_endpoint_failure_reports_and_releases() {
    let engine = MockEngine::builder()
        .failing("WebRtcEndpoint")
        .start()
        .await
        .unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(reply["id"], "error");
    let message = reply["message"].as_str().unwrap();
    assert!(message.starts_with("Error creating WebRtcEndpoint"), "{message}");

    assert!(engine.wait_for_releases(1, WAIT).await);
    assert!(relay.wait_for_sessions(0, WAIT).await);
    assert_eq!(engine.count("processOffer"), 0);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let engine = MockEngine::builder()
        .silent("processOffer")
        .start()
        .await
        .unwrap();
    let relay = TestRelay::start_with(&engine.url(), &[("ENGINE_REQUEST_TIMEOUT_SECONDS", "1")]).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(
        reply,
        json!({"id": "error", "message": "Error processing SDP offer: media engine did not respond"})
    );
    assert!(engine.wait_for_releases(1, WAIT).await);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_play_failure_reported_session_kept() {
    let engine = MockEngine::builder().failing("play").start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    let reply = client.recv_until("error").await.unwrap();
    assert!(reply["message"]
        .as_str()
        .unwrap()
        .starts_with("Error playing stream"));

    // Still negotiated: candidates flow and stop works
    client.ice_candidate(ice_candidate(1)).await.unwrap();
    assert!(engine.wait_for_count("addIceCandidate", 1, WAIT).await);
    assert_eq!(engine.release_count(), 0);
    assert_eq!(relay.session_count().await, 1);

    client.stop().await.unwrap();
    client.recv_until("stopResponse").await.unwrap();
    assert!(engine.wait_for_releases(1, WAIT).await);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_play_failure_terminates_when_configured() {
    let engine = MockEngine::builder().failing("play").start().await.unwrap();
    let relay =
        TestRelay::start_with(&engine.url(), &[("RELAY_PLAY_FAILURE_POLICY", "terminate")]).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    client.recv_until("error").await.unwrap();

    assert!(engine.wait_for_releases(1, WAIT).await);
    assert!(relay.wait_for_sessions(0, WAIT).await);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_engine_reports_connection_failure() {
    // Reserve a port, then free it so nothing listens there
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let relay = TestRelay::start(&format!("ws://{addr}/kurento")).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(reply["id"], "error");
    assert!(reply["message"]
        .as_str()
        .unwrap()
        .starts_with("Failed to get media engine connection"));
    assert!(relay.wait_for_sessions(0, WAIT).await);
    relay.shutdown().await;
}

// ============================================================================
// Protocol errors and admission
// ============================================================================

#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.send_text("{not json").await.unwrap();
    let malformed = client.recv().await.unwrap();
    assert_eq!(malformed["id"], "error");
    assert!(malformed["message"]
        .as_str()
        .unwrap()
        .starts_with("Error processing message"));

    client.send_json(&json!({"id": "dance"})).await.unwrap();
    let invalid = client.recv().await.unwrap();
    assert_eq!(invalid, json!({"id": "error", "message": "Invalid message: dance"}));

    // Connection is still usable
    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    relay.shutdown().await;
}

#[tokio::test]
async fn test_protocol_errors_do_not_affect_other_sessions() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;

    let mut streaming = relay.client().await;
    streaming.start(TEST_SDP_OFFER).await.unwrap();
    streaming.recv_until("startResponse").await.unwrap();

    let mut noisy = relay.client().await;
    noisy.send_text("{not json").await.unwrap();
    assert_eq!(noisy.recv().await.unwrap()["id"], "error");
    noisy.send_json(&json!({"id": 42})).await.unwrap();
    assert_eq!(
        noisy.recv().await.unwrap(),
        json!({"id": "error", "message": "Invalid message: 42"})
    );
    noisy.send_json(&json!({"id": "start"})).await.unwrap();
    assert_eq!(noisy.recv().await.unwrap()["id"], "error");

    // The streaming session saw nothing and is still registered
    assert!(streaming
        .try_recv(Duration::from_millis(200))
        .await
        .unwrap()
        .is_none());
    assert_eq!(relay.session_count().await, 1);
    assert_eq!(engine.count("MediaPipeline"), 1);
    assert_eq!(engine.release_count(), 0);

    streaming.stop().await.unwrap();
    let reply = streaming.recv_until("stopResponse").await.unwrap();
    assert_eq!(reply["message"], "Session stopped");
    assert!(engine.wait_for_releases(1, WAIT).await);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_start_rejected() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;
    let mut client = relay.client().await;

    client.start(TEST_SDP_OFFER).await.unwrap();
    client.recv_until("startResponse").await.unwrap();
    client.start(TEST_SDP_OFFER).await.unwrap();

    let reply = client.recv_until("error").await.unwrap();
    assert_eq!(
        reply["message"],
        "A session is already active on this connection"
    );
    assert_eq!(engine.count("MediaPipeline"), 1);
    assert_eq!(relay.session_count().await, 1);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_capacity_limit() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start_with(&engine.url(), &[("RELAY_MAX_SESSIONS", "1")]).await;

    let mut first = relay.client().await;
    first.start(TEST_SDP_OFFER).await.unwrap();
    first.recv_until("startResponse").await.unwrap();

    let mut second = relay.client().await;
    second.start(TEST_SDP_OFFER).await.unwrap();
    let reply = second.recv().await.unwrap();
    assert_eq!(
        reply,
        json!({"id": "error", "message": "Relay is at capacity, please try again later"})
    );

    // Capacity frees once the first session ends
    first.stop().await.unwrap();
    first.recv_until("stopResponse").await.unwrap();
    assert!(relay.wait_for_sessions(0, WAIT).await);

    second.start(TEST_SDP_OFFER).await.unwrap();
    second.recv_until("startResponse").await.unwrap();
    relay.shutdown().await;
}

#[tokio::test]
async fn test_drain_releases_sessions_and_refuses_new_ones() {
    let engine = MockEngine::start().await.unwrap();
    let relay = TestRelay::start(&engine.url()).await;

    let mut first = relay.client().await;
    first.start(TEST_SDP_OFFER).await.unwrap();
    first.recv_until("startResponse").await.unwrap();

    assert!(relay.registry.drain(WAIT).await.unwrap());
    assert_eq!(engine.release_count(), 1);

    let mut late = relay.client().await;
    late.start(TEST_SDP_OFFER).await.unwrap();
    let reply = late.recv().await.unwrap();
    assert_eq!(
        reply,
        json!({"id": "error", "message": "Relay is shutting down, please reconnect"})
    );
    relay.shutdown().await;
}
