//! Actor mailbox messages.

use crate::actors::session::{SessionCanceller, SessionState, TerminationReason};
use crate::errors::RelayError;
use common::types::{ConnectionId, SessionId};
use tokio::sync::oneshot;

/// Messages handled by the `SessionRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Admit a new session; rejected when at capacity or draining.
    Register {
        session_id: SessionId,
        connection_id: ConnectionId,
        canceller: SessionCanceller,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Forget a terminated session.
    Deregister {
        session_id: SessionId,
        reason: TerminationReason,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop admitting sessions and stop every active one.
    ///
    /// Responds with the number of sessions that were told to stop.
    BeginDrain { respond_to: oneshot::Sender<usize> },
}

/// Registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub session_count: usize,
    pub max_sessions: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Messages handled by a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// A text frame from the client.
    ClientText { text: String },

    /// The client went away.
    ClientClosed,

    GetState {
        respond_to: oneshot::Sender<ConnectionState>,
    },
}

/// Connection snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    /// The current (or most recent) session and its state.
    pub session: Option<(SessionId, SessionState)>,
}
