//! Observability for the RTSP relay.
//!
//! Metric labels are bounded by enums in this crate. The RTSP source URL
//! carries camera credentials and is never used as a label or log field.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_sessions_active` | Gauge | none | Sessions currently registered |
//! | `relay_sessions_started_total` | Counter | none | Sessions accepted |
//! | `relay_sessions_terminated_total` | Counter | `reason` | Session teardown causes |
//! | `relay_engine_requests_total` | Counter | `operation`, `status` | Engine control requests |
//! | `relay_engine_request_duration_seconds` | Histogram | `operation` | Engine round-trip latency |
//! | `relay_engine_reconnects_total` | Counter | none | Successful reconnections |
//! | `relay_signaling_messages_total` | Counter | `kind` | Inbound client messages |
//! | `relay_errors_total` | Counter | `kind` | Errors reported to clients |

pub mod health;
pub mod metrics;

pub use health::{health_router, track_engine_status, HealthState};
pub use metrics::init_metrics_recorder;
