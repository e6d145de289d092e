//! Client-facing signaling.
//!
//! - `messages` - the JSON message set exchanged with browsers
//! - `server` - the WebSocket gateway that feeds connection actors

pub mod messages;
pub mod server;

pub use messages::{parse_client_message, ClientMessage, ClientSender, ServerMessage};
pub use server::SignalingServer;
