//! Client signaling messages.
//!
//! Every frame is a JSON object discriminated by `id`:
//!
//! | id | direction | payload |
//! |----|-----------|---------|
//! | `start` | client → relay | `sdpOffer` |
//! | `stop` | client → relay | none |
//! | `onIceCandidate` | client → relay | `candidate` |
//! | `startResponse` | relay → client | `sdpAnswer` |
//! | `stopResponse` | relay → client | `message` |
//! | `iceCandidate` | relay → client | `candidate` |
//! | `error` | relay → client | `message` |

use crate::engine::IceCandidate;
use crate::errors::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Text of the `stopResponse` message.
pub const STOP_RESPONSE_MESSAGE: &str = "Session stopped";

/// Outbound queue to one client connection.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Messages received from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Start { sdp_offer: String },
    Stop,
    OnIceCandidate { candidate: IceCandidate },
}

impl ClientMessage {
    const KINDS: [&'static str; 3] = ["start", "stop", "onIceCandidate"];

    /// Bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Start { .. } => "start",
            ClientMessage::Stop => "stop",
            ClientMessage::OnIceCandidate { .. } => "on_ice_candidate",
        }
    }
}

/// Messages sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    StartResponse { sdp_answer: String },
    StopResponse { message: String },
    IceCandidate { candidate: IceCandidate },
    Error { message: String },
}

impl ServerMessage {
    #[must_use]
    pub fn stop_response() -> Self {
        ServerMessage::StopResponse {
            message: STOP_RESPONSE_MESSAGE.to_string(),
        }
    }

    #[must_use]
    pub fn error(err: &RelayError) -> Self {
        ServerMessage::Error {
            message: err.client_message(),
        }
    }
}

/// Parse one inbound text frame.
///
/// # Errors
///
/// - `MalformedMessage` for invalid JSON, a missing `id`, or a bad payload
/// - `InvalidKind` for an `id` that is not a known message kind, including
///   non-string ids (reported as their JSON text)
pub fn parse_client_message(text: &str) -> Result<ClientMessage, RelayError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| RelayError::MalformedMessage(e.to_string()))?;

    match value.get("id") {
        None => {
            return Err(RelayError::MalformedMessage(
                "missing message id".to_string(),
            ))
        }
        Some(Value::String(kind)) if ClientMessage::KINDS.contains(&kind.as_str()) => {}
        Some(Value::String(kind)) => return Err(RelayError::InvalidKind(kind.clone())),
        Some(other) => return Err(RelayError::InvalidKind(other.to_string())),
    }

    serde_json::from_value(value).map_err(|e| RelayError::MalformedMessage(e.to_string()))
}
