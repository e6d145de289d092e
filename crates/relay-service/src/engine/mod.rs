//! Media engine control.
//!
//! [`MediaEngine`] is the seam between the session coordinator and the
//! engine. [`KurentoEngine`] drives a Kurento media server over JSON-RPC;
//! `mock::MockMediaEngine` is an in-process double for unit tests.
//!
//! # Components
//!
//! - `transaction` - correlation ids and the pending-request table
//! - `protocol` - JSON-RPC request/response/event framing
//! - `connection` - one WebSocket control connection
//! - `client` - the shared connection, single-flight dial, reconnection loop
//! - `kurento` - `MediaEngine` over Kurento media objects

pub mod client;
pub mod connection;
pub mod kurento;
#[cfg(test)]
pub mod mock;
pub mod protocol;
pub mod transaction;

pub use client::{EngineClient, EngineClientConfig, EngineStatus, ReconnectPolicy};
pub use kurento::KurentoEngine;
pub use protocol::IceCandidate;

use crate::errors::EngineError;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Handle to an engine-side object.
///
/// `epoch` identifies the connection the object was created on; operations
/// on an object whose connection is gone fail with `NotConnected` rather than
/// being sent to a newer connection that never heard of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineObject {
    pub id: String,
    pub epoch: u64,
}

impl EngineObject {
    #[must_use]
    pub fn new(id: impl Into<String>, epoch: u64) -> Self {
        Self {
            id: id.into(),
            epoch,
        }
    }
}

impl fmt::Display for EngineObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Operations the session coordinator needs from a media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Make sure a control connection exists, dialing if needed.
    async fn ensure_connected(&self) -> Result<(), EngineError>;

    /// Create an empty pipeline.
    async fn create_pipeline(&self) -> Result<EngineObject, EngineError>;

    /// Create the media source endpoint (RTSP player) inside `pipeline`.
    async fn create_source_endpoint(
        &self,
        pipeline: &EngineObject,
        uri: &str,
    ) -> Result<EngineObject, EngineError>;

    /// Create the WebRTC sink endpoint inside `pipeline`.
    async fn create_sink_endpoint(&self, pipeline: &EngineObject)
        -> Result<EngineObject, EngineError>;

    /// Subscribe to local ICE candidates found by `endpoint`.
    ///
    /// The receiver ends when the engine connection is lost.
    async fn subscribe_ice_candidates(
        &self,
        endpoint: &EngineObject,
    ) -> Result<mpsc::UnboundedReceiver<IceCandidate>, EngineError>;

    /// Route media from `source` to `sink`.
    async fn connect(&self, source: &EngineObject, sink: &EngineObject)
        -> Result<(), EngineError>;

    /// Submit the client's SDP offer and return the engine's answer.
    async fn process_offer(&self, endpoint: &EngineObject, offer: &str)
        -> Result<String, EngineError>;

    /// Start ICE gathering on `endpoint`.
    async fn gather_candidates(&self, endpoint: &EngineObject) -> Result<(), EngineError>;

    /// Start playback on the source endpoint.
    async fn play(&self, source: &EngineObject) -> Result<(), EngineError>;

    /// Add a remote candidate supplied by the client.
    async fn add_ice_candidate(
        &self,
        endpoint: &EngineObject,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError>;

    /// Release an object. Releasing a pipeline releases its endpoints.
    async fn release(&self, object: &EngineObject) -> Result<(), EngineError>;
}
