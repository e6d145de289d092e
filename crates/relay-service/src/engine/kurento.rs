//! `MediaEngine` implementation for the Kurento media server.

use super::client::EngineClient;
use super::connection::EngineConnection;
use super::protocol::{EngineCommand, IceCandidate, ICE_CANDIDATE_FOUND};
use super::{EngineObject, MediaEngine};
use crate::errors::{EngineError, EngineOperation};
use crate::observability::metrics;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

const MEDIA_PIPELINE: &str = "MediaPipeline";
const PLAYER_ENDPOINT: &str = "PlayerEndpoint";
const WEBRTC_ENDPOINT: &str = "WebRtcEndpoint";

/// Kurento-backed media engine sharing one [`EngineClient`].
#[derive(Debug, Clone)]
pub struct KurentoEngine {
    client: EngineClient,
}

impl KurentoEngine {
    #[must_use]
    pub fn new(client: EngineClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &EngineClient {
        &self.client
    }

    async fn call(
        &self,
        conn: &EngineConnection,
        operation: EngineOperation,
        command: EngineCommand,
    ) -> Result<Value, EngineError> {
        let started = Instant::now();
        let result = conn.request(command).await;
        let status = match &result {
            Ok(_) => "success",
            Err(EngineError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        metrics::record_engine_request(operation.as_str(), status, started.elapsed());
        result
    }

    async fn create(
        &self,
        conn: &EngineConnection,
        operation: EngineOperation,
        object_type: &str,
        constructor_params: Value,
    ) -> Result<EngineObject, EngineError> {
        let value = self
            .call(
                conn,
                operation,
                EngineCommand::Create {
                    object_type: object_type.to_string(),
                    constructor_params,
                },
            )
            .await?;
        let id = value.as_str().ok_or_else(|| {
            EngineError::Protocol(format!("create {object_type} returned no object id"))
        })?;
        debug!(
            target: "relay.engine.client",
            object_type,
            object = %id,
            "Media object created"
        );
        Ok(EngineObject::new(id, conn.epoch()))
    }

    async fn invoke(
        &self,
        object: &EngineObject,
        operation: EngineOperation,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, EngineError> {
        let conn = self.client.connection_for(object.epoch).await?;
        self.call(
            &conn,
            operation,
            EngineCommand::Invoke {
                object: object.id.clone(),
                operation: method.to_string(),
                operation_params: params,
            },
        )
        .await
    }
}

#[async_trait]
impl MediaEngine for KurentoEngine {
    async fn ensure_connected(&self) -> Result<(), EngineError> {
        self.client.get_connection().await.map(|_| ())
    }

    #[instrument(skip_all)]
    async fn create_pipeline(&self) -> Result<EngineObject, EngineError> {
        let conn = self.client.current().await?;
        self.create(&conn, EngineOperation::CreatePipeline, MEDIA_PIPELINE, json!({}))
            .await
    }

    #[instrument(skip_all, fields(pipeline = %pipeline))]
    async fn create_source_endpoint(
        &self,
        pipeline: &EngineObject,
        uri: &str,
    ) -> Result<EngineObject, EngineError> {
        let conn = self.client.connection_for(pipeline.epoch).await?;
        self.create(
            &conn,
            EngineOperation::CreateSourceEndpoint,
            PLAYER_ENDPOINT,
            json!({ "mediaPipeline": pipeline.id, "uri": uri }),
        )
        .await
    }

    #[instrument(skip_all, fields(pipeline = %pipeline))]
    async fn create_sink_endpoint(
        &self,
        pipeline: &EngineObject,
    ) -> Result<EngineObject, EngineError> {
        let conn = self.client.connection_for(pipeline.epoch).await?;
        self.create(
            &conn,
            EngineOperation::CreateSinkEndpoint,
            WEBRTC_ENDPOINT,
            json!({ "mediaPipeline": pipeline.id }),
        )
        .await
    }

    async fn subscribe_ice_candidates(
        &self,
        endpoint: &EngineObject,
    ) -> Result<mpsc::UnboundedReceiver<IceCandidate>, EngineError> {
        let conn = self.client.connection_for(endpoint.epoch).await?;

        // Listen before subscribing so no early candidate is lost.
        let mut events = conn.listen(&endpoint.id).await?;
        self.call(
            &conn,
            EngineOperation::SubscribeIceCandidates,
            EngineCommand::Subscribe {
                object: endpoint.id.clone(),
                event_type: ICE_CANDIDATE_FOUND.to_string(),
            },
        )
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        if let Some(candidate) = event.ice_candidate() {
                            if tx.send(candidate).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn connect(&self, source: &EngineObject, sink: &EngineObject) -> Result<(), EngineError> {
        self.invoke(
            source,
            EngineOperation::ConnectEndpoints,
            "connect",
            Some(json!({ "sink": sink.id })),
        )
        .await
        .map(|_| ())
    }

    async fn process_offer(
        &self,
        endpoint: &EngineObject,
        offer: &str,
    ) -> Result<String, EngineError> {
        let value = self
            .invoke(
                endpoint,
                EngineOperation::ProcessOffer,
                "processOffer",
                Some(json!({ "offer": offer })),
            )
            .await?;
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| EngineError::Protocol("processOffer returned no SDP answer".to_string()))
    }

    async fn gather_candidates(&self, endpoint: &EngineObject) -> Result<(), EngineError> {
        self.invoke(
            endpoint,
            EngineOperation::GatherCandidates,
            "gatherCandidates",
            None,
        )
        .await
        .map(|_| ())
    }

    async fn play(&self, source: &EngineObject) -> Result<(), EngineError> {
        self.invoke(source, EngineOperation::Play, "play", None)
            .await
            .map(|_| ())
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &EngineObject,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError> {
        self.invoke(
            endpoint,
            EngineOperation::AddIceCandidate,
            "addIceCandidate",
            Some(json!({ "candidate": candidate.to_engine_value() })),
        )
        .await
        .map(|_| ())
    }

    async fn release(&self, object: &EngineObject) -> Result<(), EngineError> {
        let conn = self.client.connection_for(object.epoch).await?;
        self.call(
            &conn,
            EngineOperation::Release,
            EngineCommand::Release {
                object: object.id.clone(),
            },
        )
        .await
        .map(|_| ())
    }
}
