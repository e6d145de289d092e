//! `SessionRegistryActor` - singleton bookkeeper for active sessions.
//!
//! - Admits sessions up to `max_sessions`
//! - Owns the root `CancellationToken`; every session token descends from it
//! - Stops all sessions when the relay drains
//!
//! # Graceful Shutdown
//!
//! 1. `begin_drain` stops admissions and tells every session to stop
//! 2. Sessions release their pipelines and deregister
//! 3. `drain` returns once the registry is empty or the deadline passes

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{SessionCanceller, TerminationReason};
use crate::errors::RelayError;
use crate::observability::metrics;

use chrono::{DateTime, Utc};
use common::types::{ConnectionId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const REGISTRY_CHANNEL_BUFFER: usize = 1000;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to the `SessionRegistryActor`.
#[derive(Clone, Debug)]
pub struct SessionRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl SessionRegistryHandle {
    /// Admit a session.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` at `max_sessions`, `Draining` after `begin_drain`.
    pub async fn register(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
        canceller: SessionCanceller,
    ) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Register {
                session_id,
                connection_id,
                canceller,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn deregister(
        &self,
        session_id: SessionId,
        reason: TerminationReason,
    ) -> Result<(), RelayError> {
        self.sender
            .send(RegistryMessage::Deregister { session_id, reason })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop admitting sessions and stop every active one.
    ///
    /// Returns how many sessions were told to stop.
    pub async fn begin_drain(&self) -> Result<usize, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::BeginDrain { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Drain all sessions, waiting up to `deadline` for them to deregister.
    ///
    /// Returns `true` if the registry emptied in time.
    pub async fn drain(&self, deadline: Duration) -> Result<bool, RelayError> {
        let stopping = self.begin_drain().await?;
        info!(
            target: "relay.actor.registry",
            sessions = stopping,
            deadline_ms = deadline.as_millis(),
            "Draining sessions"
        );

        let wait = async {
            loop {
                if self.get_status().await?.session_count == 0 {
                    return Ok::<_, RelayError>(());
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Cancel the actor and every session it admitted.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token for a new session's canceller.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ActiveSession {
    connection_id: ConnectionId,
    canceller: SessionCanceller,
    registered_at: DateTime<Utc>,
}

/// The `SessionRegistryActor` implementation.
pub struct SessionRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    sessions: HashMap<SessionId, ActiveSession>,
    max_sessions: usize,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl SessionRegistryActor {
    /// Spawn the registry.
    #[must_use]
    pub fn spawn(
        max_sessions: usize,
        metrics: Arc<ActorMetrics>,
    ) -> (SessionRegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            sessions: HashMap::new(),
            max_sessions,
            accepting_new: true,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        let task = tokio::spawn(actor.run());

        (
            SessionRegistryHandle {
                sender,
                cancel_token,
            },
            task,
        )
    }

    #[instrument(skip_all, name = "relay.actor.registry", fields(max_sessions = self.max_sessions))]
    async fn run(mut self) {
        info!(
            target: "relay.actor.registry",
            max_sessions = self.max_sessions,
            "SessionRegistryActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.registry",
                        "SessionRegistryActor received cancellation signal"
                    );
                    self.stop_all(TerminationReason::Shutdown);
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "relay.actor.registry",
                                "SessionRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.registry",
            sessions_remaining = self.sessions.len(),
            messages_processed = self.mailbox.messages_processed(),
            "SessionRegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Register {
                session_id,
                connection_id,
                canceller,
                respond_to,
            } => {
                let result = self.register(session_id, connection_id, canceller);
                let _ = respond_to.send(result);
            }

            RegistryMessage::Deregister { session_id, reason } => {
                self.deregister(session_id, reason);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            RegistryMessage::BeginDrain { respond_to } => {
                self.accepting_new = false;
                let stopped = self.stop_all(TerminationReason::Shutdown);
                let _ = respond_to.send(stopped);
            }
        }
    }

    fn register(
        &mut self,
        session_id: SessionId,
        connection_id: ConnectionId,
        canceller: SessionCanceller,
    ) -> Result<(), RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }

        if self.sessions.len() >= self.max_sessions {
            warn!(
                target: "relay.actor.registry",
                connection_id = %connection_id,
                max_sessions = self.max_sessions,
                "Session rejected, at capacity"
            );
            return Err(RelayError::CapacityExceeded);
        }

        self.sessions.insert(
            session_id,
            ActiveSession {
                connection_id,
                canceller,
                registered_at: Utc::now(),
            },
        );
        metrics::record_session_started();
        metrics::set_sessions_active(self.sessions.len());

        debug!(
            target: "relay.actor.registry",
            session_id = %session_id,
            connection_id = %connection_id,
            total_sessions = self.sessions.len(),
            "Session registered"
        );

        Ok(())
    }

    fn deregister(&mut self, session_id: SessionId, reason: TerminationReason) {
        match self.sessions.remove(&session_id) {
            Some(session) => {
                metrics::set_sessions_active(self.sessions.len());
                debug!(
                    target: "relay.actor.registry",
                    session_id = %session_id,
                    connection_id = %session.connection_id,
                    reason = reason.as_str(),
                    active_for_ms = (Utc::now() - session.registered_at).num_milliseconds(),
                    total_sessions = self.sessions.len(),
                    "Session deregistered"
                );
            }
            None => {
                debug!(
                    target: "relay.actor.registry",
                    session_id = %session_id,
                    "Deregistration for unknown session ignored"
                );
            }
        }
    }

    fn stop_all(&mut self, reason: TerminationReason) -> usize {
        for session in self.sessions.values() {
            session.canceller.stop(reason);
        }
        self.sessions.len()
    }

    fn status(&self) -> RegistryStatus {
        RegistryStatus {
            session_count: self.sessions.len(),
            max_sessions: self.max_sessions,
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }
}
