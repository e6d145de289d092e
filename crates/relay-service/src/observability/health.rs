//! Health endpoints for the RTSP relay.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (is the media engine reachable?)
//!
//! The `/metrics` endpoint is merged in by `main` from the Prometheus handle.
//!
//! # Health State
//!
//! - `live`: Always true after startup
//! - `engine_connected`: Mirrors the engine client's connectivity status
//! - `draining`: Set on shutdown; forces readiness off

use crate::engine::EngineStatus;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Health state for the relay.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    engine_connected: AtomicBool,
    draining: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live, engine not yet connected).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            engine_connected: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }
    }

    pub fn set_engine_connected(&self, connected: bool) {
        self.engine_connected.store(connected, Ordering::SeqCst);
    }

    /// Mark the relay as shutting down. Readiness stays off from here on.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Ready when the engine is connected and the relay is not draining.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.engine_connected.load(Ordering::SeqCst) && !self.draining.load(Ordering::SeqCst)
    }
}

/// Keep `HealthState` in step with the engine client's status until cancelled.
pub async fn track_engine_status(
    health: Arc<HealthState>,
    mut status: watch::Receiver<EngineStatus>,
    cancel_token: CancellationToken,
) {
    loop {
        let connected = *status.borrow_and_update() == EngineStatus::Connected;
        health.set_engine_connected(connected);
        crate::observability::metrics::set_engine_connected(connected);
        debug!(
            target: "relay.engine.client",
            connected,
            "Readiness updated from engine status"
        );

        tokio::select! {
            () = cancel_token.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    health.set_engine_connected(false);
                    return;
                }
            }
        }
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Returns 503 while the engine is unreachable or the relay is draining.
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
