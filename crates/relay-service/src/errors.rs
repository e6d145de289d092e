//! Relay error types.
//!
//! `RelayError` is what a client ultimately sees: every variant renders a
//! client-safe message through [`RelayError::client_message`], which is sent
//! back on the signaling connection as an `error` message. `EngineError` is
//! the transport-level failure of the media engine control channel and is
//! folded into `RelayError` together with the operation that failed.

use std::time::Duration;
use thiserror::Error;

/// Media engine operations issued by the session coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOperation {
    Connect,
    CreatePipeline,
    CreateSourceEndpoint,
    CreateSinkEndpoint,
    SubscribeIceCandidates,
    ConnectEndpoints,
    ProcessOffer,
    GatherCandidates,
    Play,
    AddIceCandidate,
    Release,
}

impl EngineOperation {
    /// Returns the operation as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EngineOperation::Connect => "connect",
            EngineOperation::CreatePipeline => "create_pipeline",
            EngineOperation::CreateSourceEndpoint => "create_source_endpoint",
            EngineOperation::CreateSinkEndpoint => "create_sink_endpoint",
            EngineOperation::SubscribeIceCandidates => "subscribe_ice_candidates",
            EngineOperation::ConnectEndpoints => "connect_endpoints",
            EngineOperation::ProcessOffer => "process_offer",
            EngineOperation::GatherCandidates => "gather_candidates",
            EngineOperation::Play => "play",
            EngineOperation::AddIceCandidate => "add_ice_candidate",
            EngineOperation::Release => "release",
        }
    }

    /// Human-readable step name used in client error messages.
    #[must_use]
    pub const fn step(&self) -> &'static str {
        match self {
            EngineOperation::Connect => "connecting to media engine",
            EngineOperation::CreatePipeline => "creating MediaPipeline",
            EngineOperation::CreateSourceEndpoint => "creating PlayerEndpoint",
            EngineOperation::CreateSinkEndpoint => "creating WebRtcEndpoint",
            EngineOperation::SubscribeIceCandidates => "subscribing to ICE candidates",
            EngineOperation::ConnectEndpoints => "connecting endpoints",
            EngineOperation::ProcessOffer => "processing SDP offer",
            EngineOperation::GatherCandidates => "gathering ICE candidates",
            EngineOperation::Play => "playing stream",
            EngineOperation::AddIceCandidate => "adding ICE candidate",
            EngineOperation::Release => "releasing pipeline",
        }
    }
}

/// Failures of the media engine control channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be reached within the dial retry budget.
    #[error("could not connect to media engine at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// No live connection; calls are never queued while disconnected.
    #[error("not connected to media engine")]
    NotConnected,

    /// The engine did not answer a request in time.
    #[error("media engine request timed out after {0:?}")]
    Timeout(Duration),

    /// The engine answered with a JSON-RPC error.
    #[error("media engine error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The engine answered with something we could not interpret.
    #[error("invalid media engine response: {0}")]
    Protocol(String),
}

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The media engine cannot be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The engine failed a specific operation.
    #[error("Engine error while {}: {detail}", operation.step())]
    Engine {
        operation: EngineOperation,
        detail: String,
    },

    /// The engine did not answer a specific operation in time.
    #[error("Timed out while {} after {after:?}", operation.step())]
    Timeout {
        operation: EngineOperation,
        after: Duration,
    },

    /// Operation attempted with no live engine connection.
    #[error("Not connected to media engine")]
    NotConnected,

    /// A session already exists for this client connection.
    #[error("Session already exists for this connection")]
    DuplicateSession,

    /// ICE candidate received before the sink endpoint exists.
    #[error("No WebRtcEndpoint found for ICE candidate")]
    NoEndpoint,

    /// Client message could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Client message kind is not recognized.
    #[error("Invalid message: {0}")]
    InvalidKind(String),

    /// The relay is at its session capacity.
    #[error("Relay at capacity")]
    CapacityExceeded,

    /// The relay is shutting down.
    #[error("Relay is draining")]
    Draining,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Fold an engine failure into the client-facing taxonomy.
    #[must_use]
    pub fn from_engine(operation: EngineOperation, err: EngineError) -> Self {
        match err {
            EngineError::NotConnected => RelayError::NotConnected,
            EngineError::Unreachable { .. } => RelayError::Connection(err.to_string()),
            EngineError::Timeout(after) => RelayError::Timeout { operation, after },
            other => RelayError::Engine {
                operation,
                detail: other.to_string(),
            },
        }
    }

    /// Returns a bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            RelayError::Connection(_) => "connection_error",
            RelayError::Engine { .. } => "engine_error",
            RelayError::Timeout { .. } => "timeout",
            RelayError::NotConnected => "not_connected",
            RelayError::DuplicateSession => "duplicate_session",
            RelayError::NoEndpoint => "no_endpoint",
            RelayError::MalformedMessage(_) => "malformed_message",
            RelayError::InvalidKind(_) => "invalid_kind",
            RelayError::CapacityExceeded => "capacity_exceeded",
            RelayError::Draining => "draining",
            RelayError::Config(_) | RelayError::Internal(_) => "internal",
        }
    }

    /// Returns the message sent to the client in an `error` message.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Connection(reason) => {
                format!("Failed to get media engine connection: {reason}")
            }
            RelayError::Engine { operation, detail } => {
                format!("Error {}: {detail}", operation.step())
            }
            RelayError::Timeout { operation, .. } => {
                format!("Error {}: media engine did not respond", operation.step())
            }
            RelayError::NotConnected => "Not connected to media engine".to_string(),
            RelayError::DuplicateSession => {
                "A session is already active on this connection".to_string()
            }
            RelayError::NoEndpoint => "No WebRtcEndpoint found for ICE candidate".to_string(),
            RelayError::MalformedMessage(detail) => format!("Error processing message: {detail}"),
            RelayError::InvalidKind(kind) => format!("Invalid message: {kind}"),
            RelayError::CapacityExceeded => {
                "Relay is at capacity, please try again later".to_string()
            }
            RelayError::Draining => "Relay is shutting down, please reconnect".to_string(),
            RelayError::Config(_) | RelayError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}
