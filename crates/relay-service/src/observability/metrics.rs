//! Metrics definitions for the RTSP relay.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by enums in this crate:
//! - `operation`: engine operations (~11 values)
//! - `status`: success, error, timeout
//! - `kind`: signaling message kinds and error kinds (~15 values)
//! - `reason`: session termination reasons (~6 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Engine requests span
/// from a few milliseconds (release) to several seconds (processOffer on a
/// loaded engine), so the buckets reach 30s to cover the request timeout.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("relay_engine_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
                30.000,
            ],
        )
        .map_err(|e| format!("Failed to set engine request buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("relay_session_setup_duration_seconds".to_string()),
            &[0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000],
        )
        .map_err(|e| format!("Failed to set session setup buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Set the number of active sessions.
///
/// Metric: `relay_sessions_active`
pub fn set_sessions_active(count: usize) {
    // usize to f64 conversion is safe for realistic session counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_sessions_active").set(count as f64);
}

/// Record a session accepted by the registry.
///
/// Metric: `relay_sessions_started_total`
pub fn record_session_started() {
    counter!("relay_sessions_started_total").increment(1);
}

/// Record a session reaching `Terminated`.
///
/// Metric: `relay_sessions_terminated_total`
/// Labels: `reason` (stopped, disconnected, engine_error, connection_error, shutdown)
pub fn record_session_terminated(reason: &str) {
    counter!("relay_sessions_terminated_total", "reason" => reason.to_string()).increment(1);
}

/// Record time from `start` to `startResponse`.
///
/// Metric: `relay_session_setup_duration_seconds`
pub fn record_session_setup_duration(duration: Duration) {
    histogram!("relay_session_setup_duration_seconds").record(duration.as_secs_f64());
}

// ============================================================================
// Engine Metrics
// ============================================================================

/// Record one engine control request.
///
/// Metrics: `relay_engine_requests_total`, `relay_engine_request_duration_seconds`
/// Labels: `operation`, `status` (success, error, timeout)
pub fn record_engine_request(operation: &str, status: &str, duration: Duration) {
    histogram!("relay_engine_request_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
    counter!("relay_engine_requests_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a successful reconnection to the engine.
///
/// Metric: `relay_engine_reconnects_total`
pub fn record_engine_reconnect() {
    counter!("relay_engine_reconnects_total").increment(1);
}

/// Set engine connectivity (1 connected, 0 otherwise).
///
/// Metric: `relay_engine_connected`
pub fn set_engine_connected(connected: bool) {
    gauge!("relay_engine_connected").set(if connected { 1.0 } else { 0.0 });
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record an inbound signaling message.
///
/// Metric: `relay_signaling_messages_total`
/// Labels: `kind` (start, stop, on_ice_candidate, invalid, malformed)
pub fn record_signaling_message(kind: &str) {
    counter!("relay_signaling_messages_total", "kind" => kind.to_string()).increment(1);
}

/// Set the number of open signaling connections.
///
/// Metric: `relay_signaling_connections_active`
pub fn set_signaling_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_signaling_connections_active").set(count as f64);
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `relay_actor_mailbox_depth`
/// Labels: `actor_type` (registry, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Error Metrics
// ============================================================================

/// Record an error surfaced to a client.
///
/// Metric: `relay_errors_total`
/// Labels: `kind` (bounded by `RelayError::kind`)
pub fn record_error(kind: &str) {
    counter!("relay_errors_total", "kind" => kind.to_string()).increment(1);
}
