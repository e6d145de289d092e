//! `SessionActor` - drives one streaming session through its lifecycle.
//!
//! ```text
//! Idle -> Connecting -> PipelineCreating -> EndpointsCreating -> Negotiating -> Streaming
//!                                                                                  |
//!            (stop, disconnect, shutdown or fatal error from any state)            v
//!                                                      Stopping -> Terminated
//! ```
//!
//! Engine steps run strictly in order. A step that is already in flight when
//! the session is stopped is allowed to complete, so every object the engine
//! created is known before teardown and the pipeline is released exactly once.
//! Waiting for the engine connection is the only wait that is abandoned
//! immediately on stop.
//!
//! The current state and the sink endpoint are published through a `watch`
//! channel so the owning connection can route client ICE candidates without
//! a round trip through this actor.

use crate::actors::connection::RelayContext;
use crate::actors::registry::SessionRegistryHandle;
use crate::config::{Config, PlayFailurePolicy};
use crate::engine::{EngineObject, IceCandidate, MediaEngine};
use crate::errors::{EngineError, EngineOperation, RelayError};
use crate::observability::metrics;
use crate::signaling::messages::{ClientSender, ServerMessage};

use common::secret::{ExposeSecret, SecretString};
use common::types::{ConnectionId, SessionId};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    PipelineCreating,
    EndpointsCreating,
    Negotiating,
    Streaming,
    Stopping,
    Terminated,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::PipelineCreating => "pipeline_creating",
            SessionState::EndpointsCreating => "endpoints_creating",
            SessionState::Negotiating => "negotiating",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Terminated => "terminated",
        }
    }

    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The client sent `stop`.
    Stopped,
    /// The client connection closed.
    Disconnected,
    /// The relay is shutting down.
    Shutdown,
    /// An engine operation failed.
    EngineError,
    /// The engine could not be reached or the connection was lost.
    ConnectionError,
}

impl TerminationReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Stopped => "stopped",
            TerminationReason::Disconnected => "disconnected",
            TerminationReason::Shutdown => "shutdown",
            TerminationReason::EngineError => "engine_error",
            TerminationReason::ConnectionError => "connection_error",
        }
    }
}

/// Stops a session and remembers why.
///
/// The first reason recorded wins. A token cancelled by its parent without a
/// recorded reason reports `Shutdown`.
#[derive(Debug, Clone)]
pub struct SessionCanceller {
    token: CancellationToken,
    reason: Arc<OnceLock<TerminationReason>>,
}

impl SessionCanceller {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn stop(&self, reason: TerminationReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn reason(&self) -> TerminationReason {
        self.reason
            .get()
            .copied()
            .unwrap_or(TerminationReason::Shutdown)
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

/// Session settings shared by every session.
pub struct SessionSettings {
    /// RTSP origin handed to the source endpoint.
    pub source_uri: SecretString,
    pub play_failure: PlayFailurePolicy,
    /// How long `stop` waits for teardown before responding anyway.
    pub stop_timeout: Duration,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_uri: config.source_url.clone(),
            play_failure: config.play_failure_policy,
            // One in-flight step plus the release request.
            stop_timeout: config.engine_request_timeout * 2 + Duration::from_secs(1),
        }
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("source_uri", &"[REDACTED]")
            .field("play_failure", &self.play_failure)
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

/// Published view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// The sink endpoint, once created and until teardown begins.
    pub sink: Option<EngineObject>,
}

/// Handle to a running `SessionActor`.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    canceller: SessionCanceller,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// The sink endpoint, if the session has one.
    #[must_use]
    pub fn sink(&self) -> Option<EngineObject> {
        self.snapshot.borrow().sink.clone()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    /// Whether the actor task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&self, reason: TerminationReason) {
        self.canceller.stop(reason);
    }

    /// Wait until the session reaches `Terminated`.
    ///
    /// Returns `false` on timeout or if the actor exited without terminating.
    pub async fn wait_terminated(&self, timeout: Duration) -> bool {
        let mut rx = self.snapshot.clone();
        let terminated = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.state.is_terminated())).await,
            Ok(Ok(_))
        );
        terminated
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Consume the handle and wait for the actor task.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.task.await
    }
}

/// Why the lifecycle stopped progressing.
enum Halt {
    Cancelled,
    Failed(RelayError),
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: SessionId,
    connection_id: ConnectionId,
    sdp_offer: String,
    engine: Arc<dyn MediaEngine>,
    registry: SessionRegistryHandle,
    settings: Arc<SessionSettings>,
    canceller: SessionCanceller,
    client: ClientSender,
    snapshot: watch::Sender<SessionSnapshot>,
    pipeline: Option<EngineObject>,
    started_at: Instant,
}

impl SessionActor {
    /// Spawn a session for `sdp_offer`.
    ///
    /// The session must already be registered under `session_id`; it
    /// deregisters itself once terminated.
    #[must_use]
    pub fn spawn(
        session_id: SessionId,
        connection_id: ConnectionId,
        sdp_offer: String,
        canceller: SessionCanceller,
        ctx: &RelayContext,
        client: ClientSender,
    ) -> SessionHandle {
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot {
            state: SessionState::Idle,
            sink: None,
        });

        let actor = Self {
            session_id,
            connection_id,
            sdp_offer,
            engine: Arc::clone(&ctx.engine),
            registry: ctx.registry.clone(),
            settings: Arc::clone(&ctx.settings),
            canceller: canceller.clone(),
            client,
            snapshot,
            pipeline: None,
            started_at: Instant::now(),
        };

        let task = tokio::spawn(actor.run());

        SessionHandle {
            session_id,
            canceller,
            snapshot: snapshot_rx,
            task,
        }
    }

    #[instrument(
        skip_all,
        name = "relay.actor.session",
        fields(session_id = %self.session_id, connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        info!(
            target: "relay.actor.session",
            session_id = %self.session_id,
            "SessionActor started"
        );

        let halt = match self.negotiate().await {
            Ok(candidates) => self.relay_candidates(candidates).await,
            Err(halt) => halt,
        };

        let reason = match halt {
            Halt::Cancelled => self.canceller.reason(),
            Halt::Failed(err) => {
                let reason = match err {
                    RelayError::Connection(_) | RelayError::NotConnected => {
                        TerminationReason::ConnectionError
                    }
                    _ => TerminationReason::EngineError,
                };
                self.report(&err);
                reason
            }
        };

        self.teardown(reason).await;

        info!(
            target: "relay.actor.session",
            session_id = %self.session_id,
            reason = reason.as_str(),
            lifetime_ms = self.started_at.elapsed().as_millis(),
            "SessionActor stopped"
        );
    }

    /// Build the pipeline and answer the offer.
    ///
    /// Returns the engine's candidate stream for the streaming phase.
    async fn negotiate(&mut self) -> Result<mpsc::UnboundedReceiver<IceCandidate>, Halt> {
        self.set_state(SessionState::Connecting);
        tokio::select! {
            biased;
            () = self.canceller.stopped() => return Err(Halt::Cancelled),
            result = self.engine.ensure_connected() => {
                step(EngineOperation::Connect, result)?;
            }
        }
        self.checkpoint()?;

        self.set_state(SessionState::PipelineCreating);
        let pipeline = step(
            EngineOperation::CreatePipeline,
            self.engine.create_pipeline().await,
        )?;
        debug!(
            target: "relay.actor.session",
            session_id = %self.session_id,
            pipeline = %pipeline,
            "MediaPipeline created"
        );
        self.pipeline = Some(pipeline.clone());
        self.checkpoint()?;

        self.set_state(SessionState::EndpointsCreating);
        let source = step(
            EngineOperation::CreateSourceEndpoint,
            self.engine
                .create_source_endpoint(&pipeline, self.settings.source_uri.expose_secret())
                .await,
        )?;
        self.checkpoint()?;

        let sink = step(
            EngineOperation::CreateSinkEndpoint,
            self.engine.create_sink_endpoint(&pipeline).await,
        )?;
        self.checkpoint()?;

        let candidates = step(
            EngineOperation::SubscribeIceCandidates,
            self.engine.subscribe_ice_candidates(&sink).await,
        )?;
        self.snapshot.send_modify(|s| s.sink = Some(sink.clone()));
        self.checkpoint()?;

        step(
            EngineOperation::ConnectEndpoints,
            self.engine.connect(&source, &sink).await,
        )?;
        self.checkpoint()?;

        let answer = step(
            EngineOperation::ProcessOffer,
            self.engine.process_offer(&sink, &self.sdp_offer).await,
        )?;
        self.checkpoint()?;

        self.set_state(SessionState::Negotiating);
        // The answer must reach the client before any candidate does.
        self.send(ServerMessage::StartResponse { sdp_answer: answer });
        metrics::record_session_setup_duration(self.started_at.elapsed());

        if let Err(e) = self.engine.gather_candidates(&sink).await {
            self.report(&RelayError::from_engine(EngineOperation::GatherCandidates, e));
        }
        self.checkpoint()?;

        match self.engine.play(&source).await {
            Ok(()) => self.set_state(SessionState::Streaming),
            Err(e) => {
                let err = RelayError::from_engine(EngineOperation::Play, e);
                match self.settings.play_failure {
                    PlayFailurePolicy::Report => self.report(&err),
                    PlayFailurePolicy::Terminate => return Err(Halt::Failed(err)),
                }
            }
        }

        Ok(candidates)
    }

    /// Forward engine candidates to the client until stopped.
    async fn relay_candidates(
        &mut self,
        mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    ) -> Halt {
        loop {
            tokio::select! {
                biased;
                () = self.canceller.stopped() => return Halt::Cancelled,
                candidate = candidates.recv() => match candidate {
                    Some(candidate) => self.send(ServerMessage::IceCandidate { candidate }),
                    None => {
                        return Halt::Failed(RelayError::Connection(
                            "lost connection to media engine".to_string(),
                        ));
                    }
                },
            }
        }
    }

    async fn teardown(&mut self, reason: TerminationReason) {
        self.snapshot.send_modify(|s| s.sink = None);
        self.set_state(SessionState::Stopping);

        if let Some(pipeline) = self.pipeline.take() {
            match self.engine.release(&pipeline).await {
                Ok(()) => debug!(
                    target: "relay.actor.session",
                    session_id = %self.session_id,
                    pipeline = %pipeline,
                    "MediaPipeline released"
                ),
                Err(e) => warn!(
                    target: "relay.actor.session",
                    session_id = %self.session_id,
                    pipeline = %pipeline,
                    error = %e,
                    "Failed to release MediaPipeline"
                ),
            }
        }

        self.set_state(SessionState::Terminated);
        metrics::record_session_terminated(reason.as_str());

        if let Err(e) = self.registry.deregister(self.session_id, reason).await {
            debug!(
                target: "relay.actor.session",
                session_id = %self.session_id,
                error = %e,
                "Registry unavailable during deregistration"
            );
        }
    }

    fn checkpoint(&self) -> Result<(), Halt> {
        if self.canceller.is_stopped() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.snapshot.borrow().state;
        self.snapshot.send_modify(|s| s.state = state);
        debug!(
            target: "relay.actor.session",
            session_id = %self.session_id,
            from = previous.as_str(),
            to = state.as_str(),
            "Session state changed"
        );
    }

    fn report(&self, err: &RelayError) {
        metrics::record_error(err.kind());
        warn!(
            target: "relay.actor.session",
            session_id = %self.session_id,
            error = %err,
            "Session error"
        );
        self.send(ServerMessage::error(err));
    }

    fn send(&self, message: ServerMessage) {
        if self.client.send(message).is_err() {
            debug!(
                target: "relay.actor.session",
                session_id = %self.session_id,
                "Client gone, dropping outbound message"
            );
        }
    }
}

fn step<T>(operation: EngineOperation, result: Result<T, EngineError>) -> Result<T, Halt> {
    result.map_err(|e| Halt::Failed(RelayError::from_engine(operation, e)))
}
