//! # Relay Test Utilities
//!
//! Shared test utilities for the RTSP relay.
//!
//! Everything here talks over real sockets, so integration tests exercise
//! the relay's actual transport code.
//!
//! ## Modules
//!
//! - `mock_engine` - Kurento JSON-RPC stub with scriptable failures
//! - `signaling_client` - browser-side client for the relay's gateway
//! - `fixtures` - SDP, ICE candidates and relay environment
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = MockEngine::builder()
//!         .with_candidates(vec![ice_candidate(1)])
//!         .start()
//!         .await
//!         .unwrap();
//!
//!     // Start the relay against engine.url(), then:
//!     let mut client = TestSignalingClient::connect(&relay_url).await.unwrap();
//!     client.start(TEST_SDP_OFFER).await.unwrap();
//!     let answer = client.recv_until("startResponse").await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod mock_engine;
pub mod signaling_client;

pub use fixtures::*;
pub use mock_engine::{MockEngine, MockEngineBuilder, MOCK_ERROR_CODE};
pub use signaling_client::TestSignalingClient;
