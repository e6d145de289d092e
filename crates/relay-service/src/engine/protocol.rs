//! Kurento JSON-RPC 2.0 framing.
//!
//! Outbound frames are requests (`create`, `invoke`, `subscribe`, `release`)
//! carrying a transaction id and, once the engine has issued one, its
//! `sessionId`. Inbound frames are either responses (matched by id) or
//! `onEvent` notifications pushed without a request.

use super::transaction::TransactionId;
use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Event type emitted by a `WebRtcEndpoint` for every local candidate.
pub const ICE_CANDIDATE_FOUND: &str = "IceCandidateFound";

/// A control command addressed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Create a media object of the given type.
    Create {
        object_type: String,
        constructor_params: Value,
    },
    /// Invoke an operation on an existing object.
    Invoke {
        object: String,
        operation: String,
        operation_params: Option<Value>,
    },
    /// Subscribe to an event type on an object.
    Subscribe { object: String, event_type: String },
    /// Release an object and, for pipelines, every element it contains.
    Release { object: String },
}

impl EngineCommand {
    /// JSON-RPC method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            EngineCommand::Create { .. } => "create",
            EngineCommand::Invoke { .. } => "invoke",
            EngineCommand::Subscribe { .. } => "subscribe",
            EngineCommand::Release { .. } => "release",
        }
    }

    fn params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        match self {
            EngineCommand::Create {
                object_type,
                constructor_params,
            } => {
                params.insert("type".into(), Value::String(object_type.clone()));
                params.insert("constructorParams".into(), constructor_params.clone());
                params.insert("properties".into(), json!({}));
            }
            EngineCommand::Invoke {
                object,
                operation,
                operation_params,
            } => {
                params.insert("object".into(), Value::String(object.clone()));
                params.insert("operation".into(), Value::String(operation.clone()));
                if let Some(op_params) = operation_params {
                    params.insert("operationParams".into(), op_params.clone());
                }
            }
            EngineCommand::Subscribe { object, event_type } => {
                params.insert("type".into(), Value::String(event_type.clone()));
                params.insert("object".into(), Value::String(object.clone()));
            }
            EngineCommand::Release { object } => {
                params.insert("object".into(), Value::String(object.clone()));
            }
        }
        params
    }
}

#[derive(Debug, Serialize)]
struct RequestFrame<'a> {
    jsonrpc: &'static str,
    id: &'a TransactionId,
    method: &'static str,
    params: Map<String, Value>,
}

/// Encode a request frame.
pub fn encode_request(
    id: &TransactionId,
    command: &EngineCommand,
    session_id: Option<&str>,
) -> Result<String, EngineError> {
    let mut params = command.params();
    if let Some(session_id) = session_id {
        params.insert("sessionId".into(), Value::String(session_id.to_string()));
    }
    let frame = RequestFrame {
        jsonrpc: JSONRPC_VERSION,
        id,
        method: command.method(),
        params,
    };
    serde_json::to_string(&frame).map_err(|e| EngineError::Protocol(e.to_string()))
}

/// Successful response payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseBody {
    /// The `value` member of the result, `Null` for void operations.
    pub value: Value,
    /// Engine-issued session id, when present.
    pub session_id: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response {
        id: TransactionId,
        outcome: Result<ResponseBody, EngineError>,
    },
    Event(EngineEvent),
    /// Anything we do not act on (server-initiated requests, pings).
    Unknown,
}

/// An `onEvent` notification.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    /// Id of the object that raised the event.
    pub object: String,
    pub event_type: String,
    pub data: Value,
}

impl EngineEvent {
    /// Extract the candidate from an `IceCandidateFound` event.
    #[must_use]
    pub fn ice_candidate(&self) -> Option<IceCandidate> {
        if self.event_type != ICE_CANDIDATE_FOUND {
            return None;
        }
        serde_json::from_value(self.data.get("candidate")?.clone()).ok()
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    id: Option<Value>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<RawError>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawEventParams {
    value: RawEventValue,
}

#[derive(Debug, Deserialize)]
struct RawEventValue {
    object: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

/// Decode one inbound text frame.
pub fn decode_frame(text: &str) -> Result<InboundFrame, EngineError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| EngineError::Protocol(e.to_string()))?;

    if raw.method.as_deref() == Some("onEvent") {
        let params = raw
            .params
            .ok_or_else(|| EngineError::Protocol("onEvent without params".to_string()))?;
        let params: RawEventParams =
            serde_json::from_value(params).map_err(|e| EngineError::Protocol(e.to_string()))?;
        return Ok(InboundFrame::Event(EngineEvent {
            object: params.value.object,
            event_type: params.value.event_type,
            data: params.value.data,
        }));
    }

    let id = match raw.id {
        Some(Value::String(s)) => TransactionId::from(s.as_str()),
        Some(Value::Number(n)) => TransactionId::from(n.to_string().as_str()),
        _ => return Ok(InboundFrame::Unknown),
    };

    if raw.method.is_some() {
        return Ok(InboundFrame::Unknown);
    }

    let outcome = match (raw.error, raw.result) {
        (Some(err), _) => Err(EngineError::Rpc {
            code: err.code,
            message: err.message,
        }),
        (None, Some(result)) => Ok(ResponseBody {
            value: result.get("value").cloned().unwrap_or(Value::Null),
            session_id: result
                .get("sessionId")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }),
        (None, None) => Ok(ResponseBody {
            value: Value::Null,
            session_id: None,
        }),
    };

    Ok(InboundFrame::Response { id, outcome })
}

/// A WebRTC ICE candidate as exchanged with both the client and the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    /// Encode as the engine's `IceCandidate` complex type.
    #[must_use]
    pub fn to_engine_value(&self) -> Value {
        json!({
            "__module__": "kurento",
            "__type__": "IceCandidate",
            "candidate": self.candidate,
            "sdpMid": self.sdp_mid.clone().unwrap_or_default(),
            "sdpMLineIndex": self.sdp_m_line_index.unwrap_or(0),
        })
    }
}
