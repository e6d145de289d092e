//! WebSocket signaling gateway.
//!
//! Accepts client WebSocket connections on the configured path and gives
//! each one a `ConnectionActor`. Frames are read in order and handed to the
//! actor; everything the actor or its session emits goes out through a
//! per-connection writer task.

use crate::actors::metrics::ActorType;
use crate::actors::{ConnectionActor, RelayContext};
use crate::errors::RelayError;
use crate::signaling::messages::ServerMessage;

use common::types::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Bound on flushing queued messages after a connection ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Signaling gateway bound to a TCP listener.
pub struct SignalingServer {
    listener: TcpListener,
    path: String,
    ctx: RelayContext,
}

impl SignalingServer {
    /// Bind the gateway. Only WebSocket upgrades on `path` are accepted.
    pub async fn bind(
        address: &str,
        path: impl Into<String>,
        ctx: RelayContext,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| RelayError::Internal(format!("failed to bind {address}: {e}")))?;

        Ok(Self {
            listener,
            path: path.into(),
            ctx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.listener
            .local_addr()
            .map_err(|e| RelayError::Internal(format!("failed to read local address: {e}")))
    }

    /// Accept connections until `cancel` fires.
    ///
    /// Each connection runs under a child of `cancel`.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            target: "relay.signaling",
            address = ?self.listener.local_addr().ok(),
            path = %self.path,
            "Signaling server listening"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            self.path.clone(),
                            self.ctx.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!(
                            target: "relay.signaling",
                            error = %e,
                            "Failed to accept connection"
                        );
                    }
                },
            }
        }

        info!(target: "relay.signaling", "Signaling server stopped");
    }
}

#[instrument(skip_all, name = "relay.signaling.connection", fields(peer = %peer))]
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    path: String,
    ctx: RelayContext,
    cancel: CancellationToken,
) {
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let socket = match accept_hdr_async(stream, check_path).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(
                target: "relay.signaling",
                peer = %peer,
                error = %e,
                "WebSocket handshake rejected"
            );
            return;
        }
    };

    let connection_id = ConnectionId::new();
    info!(
        target: "relay.signaling",
        peer = %peer,
        connection_id = %connection_id,
        "Client connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let metrics = ctx.metrics.clone();
    let (actor, actor_task) =
        ConnectionActor::spawn(connection_id, cancel.child_token(), ctx, client_tx);

    let mut writer = tokio::spawn(async move {
        while let Some(message) = client_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        target: "relay.signaling",
                        error = %e,
                        "Failed to encode outbound message"
                    );
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                debug!(target: "relay.signaling", error = %e, "Client write failed");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if actor.client_text(text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Parsed like text frames.
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if actor.client_text(text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(
                        target: "relay.signaling",
                        connection_id = %connection_id,
                        error = %e,
                        "Client read failed"
                    );
                    break;
                }
            },
        }
    }

    let _ = actor.client_closed().await;
    if let Err(e) = actor_task.await {
        if e.is_panic() {
            metrics.record_panic(ActorType::Connection);
        }
    }

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(
        target: "relay.signaling",
        connection_id = %connection_id,
        "Client disconnected"
    );
}
