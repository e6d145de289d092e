//! Session coordination actors.
//!
//! ```text
//! SessionRegistryActor (singleton)
//! ├── admits sessions up to the configured capacity
//! └── holds a stop handle for every active session
//!
//! ConnectionActor (one per client signaling connection)
//! └── SessionActor (at most one live per connection)
//!     └── drives the engine: pipeline, endpoints, negotiation, teardown
//! ```
//!
//! # Key Design Decisions
//!
//! - **One live session per connection**: a second `start` is rejected
//! - **CancellationToken propagation**: every session token descends from the registry's
//! - **Published session state**: ICE routing reads the sink from a `watch` channel
//! - **Message passing**: actors talk over `tokio::sync::mpsc` mailboxes
//!
//! # Modules
//!
//! - [`registry`] - `SessionRegistryActor`, capacity and drain
//! - [`connection`] - `ConnectionActor`, client message handling
//! - [`session`] - `SessionActor`, the session state machine
//! - [`messages`] - mailbox message types
//! - [`metrics`] - mailbox monitoring and actor counters

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod session;

pub use connection::{ConnectionActor, ConnectionActorHandle, RelayContext};
pub use messages::*;
pub use metrics::{ActorMetrics, MailboxMonitor};
pub use registry::{SessionRegistryActor, SessionRegistryHandle};
pub use session::{
    SessionActor, SessionCanceller, SessionHandle, SessionSettings, SessionSnapshot,
    SessionState, TerminationReason,
};
