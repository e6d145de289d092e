//! A single WebSocket control connection to the media engine.
//!
//! The socket is split into a writer task fed by an mpsc queue and a reader
//! task that resolves pending transactions and fans `onEvent` notifications
//! out to per-object listeners. When either side ends, the `closed` token is
//! cancelled, every outstanding request fails with `NotConnected`, and all
//! listener channels are dropped so subscribers observe the loss.

use super::protocol::{decode_frame, encode_request, EngineCommand, EngineEvent, InboundFrame};
use super::transaction::{PendingTransactions, TransactionId};
use crate::errors::EngineError;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared between the connection handle and its reader task.
#[derive(Debug, Default)]
struct Shared {
    pending: PendingTransactions,
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<EngineEvent>>>,
    session_id: RwLock<Option<String>>,
}

impl Shared {
    async fn handle_text(&self, text: &str) {
        match decode_frame(text) {
            Ok(InboundFrame::Response { id, outcome }) => {
                let result = match outcome {
                    Ok(body) => {
                        if let Some(session_id) = body.session_id {
                            let mut current = self.session_id.write().await;
                            if current.as_deref() != Some(session_id.as_str()) {
                                debug!(
                                    target: "relay.engine.connection",
                                    engine_session_id = %session_id,
                                    "Engine session id assigned"
                                );
                                *current = Some(session_id);
                            }
                        }
                        Ok(body.value)
                    }
                    Err(e) => Err(e),
                };
                self.pending.resolve(&id, result).await;
            }
            Ok(InboundFrame::Event(event)) => {
                let mut listeners = self.listeners.lock().await;
                if let Some(tx) = listeners.get(&event.object) {
                    if tx.send(event.clone()).is_err() {
                        listeners.remove(&event.object);
                    }
                } else {
                    debug!(
                        target: "relay.engine.connection",
                        object = %event.object,
                        event_type = %event.event_type,
                        "Dropping event for object without listener"
                    );
                }
            }
            Ok(InboundFrame::Unknown) => {}
            Err(e) => {
                warn!(
                    target: "relay.engine.connection",
                    error = %e,
                    "Ignoring undecodable frame from media engine"
                );
            }
        }
    }
}

/// Handle to one live engine connection.
#[derive(Debug)]
pub struct EngineConnection {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    closed: CancellationToken,
    request_timeout: Duration,
}

impl EngineConnection {
    /// Dial the engine once.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unreachable` if the WebSocket handshake fails or
    /// does not complete within `connect_timeout`.
    pub async fn open(
        url: &str,
        epoch: u64,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, EngineError> {
        let unreachable = |reason: String| EngineError::Unreachable {
            endpoint: url.to_string(),
            reason,
        };

        let (stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| unreachable(format!("timed out after {connect_timeout:?}")))?
            .map_err(|e| unreachable(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(Shared::default());
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_closed.cancelled() => break,
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = sink.send(msg).await {
                            warn!(
                                target: "relay.engine.connection",
                                epoch,
                                error = %e,
                                "Write to media engine failed"
                            );
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
            writer_closed.cancel();
        });

        let reader_closed = closed.clone();
        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reader_closed.cancelled() => break,
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => reader_shared.handle_text(&text).await,
                        Some(Ok(Message::Close(_))) | None => {
                            info!(
                                target: "relay.engine.connection",
                                epoch,
                                "Media engine closed the connection"
                            );
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(
                                target: "relay.engine.connection",
                                epoch,
                                error = %e,
                                "Read from media engine failed"
                            );
                            break;
                        }
                    }
                }
            }
            // Cancel before failing pending requests so that a request
            // registered concurrently observes the closed token.
            reader_closed.cancel();
            let failed = reader_shared
                .pending
                .fail_all(&EngineError::NotConnected)
                .await;
            reader_shared.listeners.lock().await.clear();
            debug!(
                target: "relay.engine.connection",
                epoch,
                failed_requests = failed,
                "Engine connection torn down"
            );
        });

        info!(
            target: "relay.engine.connection",
            epoch,
            endpoint = %url,
            "Connected to media engine"
        );

        Ok(Arc::new(Self {
            epoch,
            outbound,
            shared,
            closed,
            request_timeout,
        }))
    }

    /// Connection generation; objects created on this connection carry it.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the connection goes away.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Engine-issued session id, once one has been seen.
    pub async fn engine_session_id(&self) -> Option<String> {
        self.shared.session_id.read().await.clone()
    }

    /// Close the connection. Outstanding requests fail with `NotConnected`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Issue one request and wait for its correlated response.
    ///
    /// # Errors
    ///
    /// - `NotConnected` if the connection is (or becomes) closed
    /// - `Timeout` if no response arrives within the request timeout
    /// - `Rpc` if the engine answers with an error
    pub async fn request(&self, command: EngineCommand) -> Result<Value, EngineError> {
        if self.is_closed() {
            return Err(EngineError::NotConnected);
        }

        let id = TransactionId::new();
        let session_id = self.engine_session_id().await;
        let frame = encode_request(&id, &command, session_id.as_deref())?;

        let rx = self.shared.pending.register(id.clone()).await;
        if self.is_closed() || self.outbound.send(Message::Text(frame)).is_err() {
            self.shared.pending.cancel(&id).await;
            return Err(EngineError::NotConnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::NotConnected),
            Err(_) => {
                self.shared.pending.cancel(&id).await;
                Err(EngineError::Timeout(self.request_timeout))
            }
        }
    }

    /// Route `onEvent` notifications raised by `object` to a channel.
    ///
    /// A later call for the same object replaces the earlier listener.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if the connection is closed.
    pub async fn listen(
        &self,
        object: &str,
    ) -> Result<mpsc::UnboundedReceiver<EngineEvent>, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.shared.listeners.lock().await;
        if self.is_closed() {
            return Err(EngineError::NotConnected);
        }
        listeners.retain(|_, existing| !existing.is_closed());
        listeners.insert(object.to_string(), tx);
        Ok(rx)
    }

    /// Number of requests awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.shared.pending.len().await
    }
}

impl Drop for EngineConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
