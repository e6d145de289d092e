//! Browser-side signaling client for relay tests.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default bound on waiting for a relay message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Speaks the relay's client protocol over a real WebSocket.
pub struct TestSignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestSignalingClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (ws, _) = connect_async(url).await?;
        Ok(Self { ws })
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> anyhow::Result<()> {
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn send_json(&mut self, message: &Value) -> anyhow::Result<()> {
        self.send_text(message.to_string()).await
    }

    pub async fn start(&mut self, sdp_offer: &str) -> anyhow::Result<()> {
        self.send_json(&json!({ "id": "start", "sdpOffer": sdp_offer }))
            .await
    }

    pub async fn stop(&mut self) -> anyhow::Result<()> {
        self.send_json(&json!({ "id": "stop" })).await
    }

    pub async fn ice_candidate(&mut self, candidate: Value) -> anyhow::Result<()> {
        self.send_json(&json!({ "id": "onIceCandidate", "candidate": candidate }))
            .await
    }

    /// Next JSON message from the relay.
    ///
    /// Fails on timeout or if the relay closed the connection.
    pub async fn recv(&mut self) -> anyhow::Result<Value> {
        self.try_recv(RECV_TIMEOUT)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no message within {RECV_TIMEOUT:?}"))
    }

    /// Next JSON message, or `None` if nothing arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> anyhow::Result<Option<Value>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return Ok(None),
                Ok(frame) => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => return Ok(Some(serde_json::from_str(&text)?)),
                Some(Ok(Message::Close(_))) | None => anyhow::bail!("relay closed the connection"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Skip messages until one with `id == kind` arrives.
    pub async fn recv_until(&mut self, kind: &str) -> anyhow::Result<Value> {
        loop {
            let message = self.recv().await?;
            if message["id"] == kind {
                return Ok(message);
            }
        }
    }

    /// Collect every message that arrives within `wait`.
    pub async fn drain(&mut self, wait: Duration) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = self.try_recv(wait).await {
            messages.push(message);
        }
        messages
    }

    /// Close handshake, then drop.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
