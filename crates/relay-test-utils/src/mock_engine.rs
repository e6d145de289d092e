//! Kurento stub engine for relay testing.
//!
//! A real WebSocket server speaking the Kurento JSON-RPC dialect closely
//! enough for the relay's engine client:
//! - `create` returns Kurento-style object ids and a per-connection `sessionId`
//! - `processOffer` returns a canned SDP answer
//! - `gatherCandidates` emits `IceCandidateFound` events to subscribers
//! - `release` and `addIceCandidate` are recorded for assertions
//!
//! Operations can be scripted to fail or to never answer, and every live
//! connection can be dropped at once to simulate an engine crash.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_test_utils::MockEngine;
//!
//! let engine = MockEngine::builder()
//!     .with_answer("v=0 answer")
//!     .failing("play")
//!     .start()
//!     .await?;
//!
//! // Point the relay at engine.url()...
//! assert_eq!(engine.release_count(), 0);
//! ```

use crate::fixtures::TEST_SDP_ANSWER;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error code returned for scripted failures.
pub const MOCK_ERROR_CODE: i64 = 40001;

/// Stub behavior.
#[derive(Debug, Clone)]
struct Script {
    answer: String,
    candidates: Vec<Value>,
    failing: HashMap<String, String>,
    silent: HashSet<String>,
    delays: HashMap<String, Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            answer: TEST_SDP_ANSWER.to_string(),
            candidates: Vec::new(),
            failing: HashMap::new(),
            silent: HashSet::new(),
            delays: HashMap::new(),
        }
    }
}

/// What the stub has seen.
#[derive(Debug, Default)]
struct Recorded {
    connections_accepted: AtomicUsize,
    requests: Mutex<Vec<Value>>,
    released: Mutex<Vec<String>>,
    remote_candidates: Mutex<Vec<Value>>,
    live: Mutex<Vec<CancellationToken>>,
}

/// Builder for `MockEngine`.
#[derive(Debug, Default)]
pub struct MockEngineBuilder {
    script: Script,
}

impl MockEngineBuilder {
    /// Return `answer` from `processOffer`.
    #[must_use]
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.script.answer = answer.into();
        self
    }

    /// Emit these candidates (client format) after `gatherCandidates`.
    #[must_use]
    pub fn with_candidates(mut self, candidates: Vec<Value>) -> Self {
        self.script.candidates = candidates;
        self
    }

    /// Answer `key` with a JSON-RPC error.
    ///
    /// `key` is the created type for `create` (e.g. `WebRtcEndpoint`), the
    /// operation for `invoke` (e.g. `play`), or the method otherwise.
    #[must_use]
    pub fn failing(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        let message = format!("mock failure in {key}");
        self.script.failing.insert(key, message);
        self
    }

    /// Never answer `key`.
    #[must_use]
    pub fn silent(mut self, key: impl Into<String>) -> Self {
        self.script.silent.insert(key.into());
        self
    }

    /// Wait `delay` before answering `key`.
    #[must_use]
    pub fn delayed(mut self, key: impl Into<String>, delay: Duration) -> Self {
        self.script.delays.insert(key.into(), delay);
        self
    }

    /// Start on a random local port.
    pub async fn start(self) -> anyhow::Result<MockEngine> {
        self.start_on("127.0.0.1:0".parse()?).await
    }

    /// Start on a specific address, e.g. to bring an engine "back" on the
    /// port a previous instance used.
    pub async fn start_on(self, addr: SocketAddr) -> anyhow::Result<MockEngine> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let script = Arc::new(self.script);
        let recorded = Arc::new(Recorded::default());
        let shutdown = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&script),
            Arc::clone(&recorded),
            shutdown.clone(),
        ));

        Ok(MockEngine {
            addr,
            recorded,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }
}

/// Kurento stub engine.
pub struct MockEngine {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockEngine {
    #[must_use]
    pub fn builder() -> MockEngineBuilder {
        MockEngineBuilder::default()
    }

    /// Start a stub that succeeds at everything.
    pub async fn start() -> anyhow::Result<Self> {
        Self::builder().start().await
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Control URL for the relay's engine client.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/kurento", self.addr)
    }

    /// Connections accepted so far, counted before the handshake.
    #[must_use]
    pub fn connections_accepted(&self) -> usize {
        self.recorded.connections_accepted.load(Ordering::SeqCst)
    }

    /// Object ids released so far.
    #[must_use]
    pub fn released(&self) -> Vec<String> {
        self.recorded.released.lock().unwrap().clone()
    }

    #[must_use]
    pub fn release_count(&self) -> usize {
        self.recorded.released.lock().unwrap().len()
    }

    /// Candidates passed to `addIceCandidate`, as sent by the relay.
    #[must_use]
    pub fn remote_candidates(&self) -> Vec<Value> {
        self.recorded.remote_candidates.lock().unwrap().clone()
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<Value> {
        self.recorded.requests.lock().unwrap().clone()
    }

    /// Requests matching `key` (see [`MockEngineBuilder::failing`]).
    #[must_use]
    pub fn count(&self, key: &str) -> usize {
        self.recorded
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| request_key(r) == key)
            .count()
    }

    /// Wait until `count(key)` reaches `n`.
    pub async fn wait_for_count(&self, key: &str, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count(key) >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count(key) >= n
    }

    /// Wait until `connections_accepted()` reaches `n`.
    pub async fn wait_for_connections(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.connections_accepted() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.connections_accepted() >= n
    }

    /// Wait until `release_count()` reaches `n`.
    pub async fn wait_for_releases(&self, n: usize, timeout: Duration) -> bool {
        self.wait_for_count("release", n, timeout).await
    }

    /// Drop every live connection without a close handshake.
    pub fn drop_all_connections(&self) {
        for token in self.recorded.live.lock().unwrap().drain(..) {
            token.cancel();
        }
    }

    /// Stop accepting, drop every connection and free the port.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drop_all_connections();
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    script: Arc<Script>,
    recorded: Arc<Recorded>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                recorded.connections_accepted.fetch_add(1, Ordering::SeqCst);
                let token = shutdown.child_token();
                recorded.live.lock().unwrap().push(token.clone());
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&script),
                    Arc::clone(&recorded),
                    token,
                ));
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    script: Arc<Script>,
    recorded: Arc<Recorded>,
    token: CancellationToken,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };

    let (mut tx, mut rx) = ws.split();
    let mut connection = ConnectionState {
        session_id: Uuid::new_v4().to_string(),
        subscriptions: HashSet::new(),
    };

    loop {
        tokio::select! {
            () = token.cancelled() => return,
            frame = rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    recorded.requests.lock().unwrap().push(request.clone());

                    let key = request_key(&request);
                    if script.silent.contains(&key) {
                        continue;
                    }
                    if let Some(delay) = script.delays.get(&key) {
                        tokio::time::sleep(*delay).await;
                    }

                    for reply in connection.handle(&request, &script, &recorded) {
                        if tx.send(Message::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

struct ConnectionState {
    session_id: String,
    /// (object, event type) pairs subscribed on this connection.
    subscriptions: HashSet<(String, String)>,
}

impl ConnectionState {
    /// Replies for one request: the response, then any events it triggers.
    fn handle(&mut self, request: &Value, script: &Script, recorded: &Recorded) -> Vec<Value> {
        let id = request["id"].clone();
        let params = &request["params"];
        let key = request_key(request);

        if let Some(message) = script.failing.get(&key) {
            return vec![json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": MOCK_ERROR_CODE, "message": message },
            })];
        }

        let mut events = Vec::new();
        let value = match request["method"].as_str().unwrap_or_default() {
            "create" => {
                let object_type = params["type"].as_str().unwrap_or("Unknown");
                let own = format!("{}_kurento.{object_type}", Uuid::new_v4());
                match params["constructorParams"]["mediaPipeline"].as_str() {
                    Some(pipeline) => json!(format!("{pipeline}/{own}")),
                    None => json!(own),
                }
            }
            "invoke" => {
                let object = params["object"].as_str().unwrap_or_default();
                match params["operation"].as_str().unwrap_or_default() {
                    "processOffer" => json!(script.answer),
                    "gatherCandidates" => {
                        if self
                            .subscriptions
                            .contains(&(object.to_string(), "IceCandidateFound".to_string()))
                        {
                            events.extend(
                                script
                                    .candidates
                                    .iter()
                                    .map(|c| ice_candidate_event(object, c)),
                            );
                        }
                        Value::Null
                    }
                    "addIceCandidate" => {
                        recorded
                            .remote_candidates
                            .lock()
                            .unwrap()
                            .push(params["operationParams"]["candidate"].clone());
                        Value::Null
                    }
                    _ => Value::Null,
                }
            }
            "subscribe" => {
                let object = params["object"].as_str().unwrap_or_default().to_string();
                let event_type = params["type"].as_str().unwrap_or_default().to_string();
                self.subscriptions.insert((object, event_type));
                json!(Uuid::new_v4().to_string())
            }
            "release" => {
                let object = params["object"].as_str().unwrap_or_default().to_string();
                recorded.released.lock().unwrap().push(object);
                Value::Null
            }
            _ => Value::Null,
        };

        let mut replies = vec![json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "value": value, "sessionId": self.session_id },
        })];
        replies.extend(events);
        replies
    }
}

/// Key used for scripting: created type, invoked operation, or method.
fn request_key(request: &Value) -> String {
    let params = &request["params"];
    match request["method"].as_str().unwrap_or_default() {
        "create" => params["type"].as_str().unwrap_or_default().to_string(),
        "invoke" => params["operation"].as_str().unwrap_or_default().to_string(),
        other => other.to_string(),
    }
}

fn ice_candidate_event(object: &str, candidate: &Value) -> Value {
    let mut engine_candidate = json!({
        "__module__": "kurento",
        "__type__": "IceCandidate",
    });
    if let (Some(target), Some(source)) = (engine_candidate.as_object_mut(), candidate.as_object()) {
        for (k, v) in source {
            target.insert(k.clone(), v.clone());
        }
    }

    json!({
        "jsonrpc": "2.0",
        "method": "onEvent",
        "params": {
            "value": {
                "object": object,
                "type": "IceCandidateFound",
                "data": {
                    "source": object,
                    "type": "IceCandidateFound",
                    "tags": [],
                    "candidate": engine_candidate,
                },
            },
        },
    })
}
