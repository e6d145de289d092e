//! `ConnectionActor` - one per client signaling connection.
//!
//! Each `ConnectionActor`:
//! - Parses client frames and processes them strictly in arrival order
//! - Owns at most one live session at a time
//! - Forwards client ICE candidates to the session's sink endpoint
//! - Stops its session when the client goes away
//!
//! Outbound messages (from this actor and from its session) share one
//! `ClientSender` queue drained by the connection's writer task.

use super::messages::{ConnectionMessage, ConnectionState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::SessionRegistryHandle;
use super::session::{SessionActor, SessionCanceller, SessionHandle, SessionSettings, TerminationReason};
use crate::engine::{IceCandidate, MediaEngine};
use crate::errors::{EngineOperation, RelayError};
use crate::observability::metrics;
use crate::signaling::messages::{parse_client_message, ClientMessage, ClientSender, ServerMessage};

use common::types::{ConnectionId, SessionId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const CONNECTION_CHANNEL_BUFFER: usize = 64;

/// Shared dependencies handed to every connection.
#[derive(Clone)]
pub struct RelayContext {
    pub engine: Arc<dyn MediaEngine>,
    pub registry: SessionRegistryHandle,
    pub settings: Arc<SessionSettings>,
    pub metrics: Arc<ActorMetrics>,
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Deliver a text frame from the client.
    pub async fn client_text(&self, text: String) -> Result<(), RelayError> {
        self.sender
            .send(ConnectionMessage::ClientText { text })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    /// Tell the actor the client is gone.
    pub async fn client_closed(&self) -> Result<(), RelayError> {
        self.sender
            .send(ConnectionMessage::ClientClosed)
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn get_state(&self) -> Result<ConnectionState, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    ctx: RelayContext,
    client: ClientSender,
    session: Option<SessionHandle>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn an actor for a newly accepted client.
    #[must_use]
    pub fn spawn(
        connection_id: ConnectionId,
        cancel_token: CancellationToken,
        ctx: RelayContext,
        client: ClientSender,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        let actor = Self {
            connection_id,
            receiver,
            cancel_token: cancel_token.clone(),
            ctx,
            client,
            session: None,
            mailbox: MailboxMonitor::new(ActorType::Connection, connection_id.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "relay.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        self.ctx.metrics.connection_created();
        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let reason = loop {
            self.check_session_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break TerminationReason::Shutdown;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ConnectionMessage::ClientClosed) | None => {
                            break TerminationReason::Disconnected;
                        }
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.ctx.metrics.record_message_processed();
                        }
                    }
                }
            }
        };

        self.end_session(reason).await;
        self.ctx.metrics.connection_closed();

        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            reason = reason.as_str(),
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ConnectionMessage) {
        match message {
            ConnectionMessage::ClientText { text } => self.handle_text(&text).await,

            ConnectionMessage::GetState { respond_to } => {
                let state = ConnectionState {
                    connection_id: self.connection_id,
                    session: self
                        .session
                        .as_ref()
                        .map(|s| (s.session_id(), s.state())),
                };
                let _ = respond_to.send(state);
            }

            // Handled by the run loop.
            ConnectionMessage::ClientClosed => {}
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(err) => {
                self.report(&err);
                return;
            }
        };
        metrics::record_signaling_message(message.kind());

        match message {
            ClientMessage::Start { sdp_offer } => {
                if let Err(err) = self.start_session(sdp_offer).await {
                    self.report(&err);
                }
            }
            ClientMessage::Stop => {
                if self.end_session(TerminationReason::Stopped).await {
                    self.send(ServerMessage::stop_response());
                }
            }
            ClientMessage::OnIceCandidate { candidate } => {
                if let Err(err) = self.add_remote_candidate(&candidate).await {
                    self.report(&err);
                }
            }
        }
    }

    async fn start_session(&mut self, sdp_offer: String) -> Result<(), RelayError> {
        if self.session.as_ref().is_some_and(|s| !s.is_terminated()) {
            return Err(RelayError::DuplicateSession);
        }

        let session_id = SessionId::new();
        let canceller = SessionCanceller::new(self.ctx.registry.child_token());
        self.ctx
            .registry
            .register(session_id, self.connection_id, canceller.clone())
            .await?;

        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            session_id = %session_id,
            "Starting session"
        );

        self.session = Some(SessionActor::spawn(
            session_id,
            self.connection_id,
            sdp_offer,
            canceller,
            &self.ctx,
            self.client.clone(),
        ));
        Ok(())
    }

    /// Stop the live session and wait for its teardown.
    ///
    /// Returns `false` when there was no live session.
    async fn end_session(&mut self, reason: TerminationReason) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        if session.is_terminated() {
            return false;
        }

        session.stop(reason);
        if !session
            .wait_terminated(self.ctx.settings.stop_timeout)
            .await
        {
            warn!(
                target: "relay.actor.connection",
                connection_id = %self.connection_id,
                session_id = %session.session_id(),
                "Session did not terminate in time"
            );
        }
        true
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), RelayError> {
        let sink = self
            .session
            .as_ref()
            .and_then(SessionHandle::sink)
            .ok_or(RelayError::NoEndpoint)?;

        self.ctx
            .engine
            .add_ice_candidate(&sink, candidate)
            .await
            .map_err(|e| RelayError::from_engine(EngineOperation::AddIceCandidate, e))
    }

    /// Detect a session task that exited without terminating (a panic).
    async fn check_session_health(&mut self) {
        let exited = self
            .session
            .as_ref()
            .is_some_and(|s| s.is_finished() && !s.is_terminated());
        if !exited {
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };

        let session_id = session.session_id();
        if let Err(e) = session.join().await {
            if e.is_panic() {
                self.ctx.metrics.record_panic(ActorType::Session);
            }
        }
        let _ = self
            .ctx
            .registry
            .deregister(session_id, TerminationReason::EngineError)
            .await;
        self.report(&RelayError::Internal("session task exited".to_string()));
    }

    fn report(&self, err: &RelayError) {
        metrics::record_error(err.kind());
        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            error = %err,
            "Client request failed"
        );
        self.send(ServerMessage::error(err));
    }

    fn send(&self, message: ServerMessage) {
        if self.client.send(message).is_err() {
            debug!(
                target: "relay.actor.connection",
                connection_id = %self.connection_id,
                "Client gone, dropping outbound message"
            );
        }
    }
}
