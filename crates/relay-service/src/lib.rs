//! RTSP Relay Service Library
//!
//! A WebSocket signaling gateway that lets browsers watch an RTSP camera
//! over WebRTC. The relay never touches media itself; it drives a Kurento
//! media server over JSON-RPC:
//!
//! 1. create a `MediaPipeline`
//! 2. create a `PlayerEndpoint` (RTSP source) and a `WebRtcEndpoint` (browser sink)
//! 3. connect them, process the browser's SDP offer, gather candidates, play
//! 4. relay ICE candidates both ways
//! 5. release the pipeline on stop or disconnect
//!
//! # Architecture
//!
//! ```text
//! SignalingServer ──> ConnectionActor (per client) ──> SessionActor (per session)
//!                                                          │
//!                     SessionRegistryActor <───────────────┤
//!                                                          v
//!                                          MediaEngine (KurentoEngine)
//!                                                          │
//!                                          EngineClient ──> EngineConnection (WebSocket)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - session registry, connection and session actors
//! - [`config`] - service configuration from environment
//! - [`engine`] - media engine control (JSON-RPC transport, Kurento adapter)
//! - [`errors`] - error taxonomy and client-facing messages
//! - [`observability`] - metrics and health endpoints
//! - [`signaling`] - client WebSocket gateway and message set

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod signaling;
