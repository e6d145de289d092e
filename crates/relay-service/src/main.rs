//! RTSP Relay
//!
//! WebSocket signaling gateway bridging an RTSP camera to browsers over
//! WebRTC through a Kurento media server.
//!
//! # Servers
//!
//! - WebSocket signaling gateway (default: 0.0.0.0:3000, path `/kurento`)
//! - HTTP server for health and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start health HTTP server (liveness, readiness, metrics)
//! 4. Create the engine client and probe the engine once (not fatal)
//! 5. Spawn the session registry
//! 6. Start the signaling gateway
//! 7. Wait for shutdown signal
//!
//! # Shutdown Flow
//!
//! 1. Drop readiness
//! 2. Stop the gateway; client connections stop their sessions
//! 3. Drain the registry while the engine connection is still up
//! 4. Close the engine connection

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use relay_service::actors::{ActorMetrics, RelayContext, SessionRegistryActor, SessionSettings};
use relay_service::config::Config;
use relay_service::engine::{EngineClient, EngineClientConfig, KurentoEngine};
use relay_service::observability::{
    health_router, init_metrics_recorder, track_engine_status, HealthState,
};
use relay_service::signaling::SignalingServer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bound on waiting for sessions to release their pipelines at shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RTSP Relay");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        engine_url = %config.engine_url,
        signaling_bind_address = %config.signaling_bind_address,
        signaling_path = %config.signaling_path,
        health_bind_address = %config.health_bind_address,
        play_failure_policy = ?config.play_failure_policy,
        max_sessions = config.max_sessions,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Engine client
    let engine_client = EngineClient::new(EngineClientConfig::from_config(&config));
    tokio::spawn(track_engine_status(
        Arc::clone(&health_state),
        engine_client.subscribe_status(),
        shutdown_token.child_token(),
    ));

    // Connectivity probe. Not fatal: sessions dial on demand and readiness
    // reports the outcome.
    let probe_client = engine_client.clone();
    tokio::spawn(async move {
        match probe_client.get_connection().await {
            Ok(_) => info!(url = %probe_client.url(), "Media engine reachable"),
            Err(e) => warn!(
                url = %probe_client.url(),
                error = %e,
                "Media engine unreachable at startup"
            ),
        }
    });

    // Actor system
    let actor_metrics = ActorMetrics::new();
    let (registry, registry_task) =
        SessionRegistryActor::spawn(config.max_sessions, Arc::clone(&actor_metrics));
    let ctx = RelayContext {
        engine: Arc::new(KurentoEngine::new(engine_client.clone())),
        registry: registry.clone(),
        settings: Arc::new(SessionSettings::from_config(&config)),
        metrics: actor_metrics,
    };

    // Signaling gateway
    let signaling = SignalingServer::bind(
        &config.signaling_bind_address,
        config.signaling_path.clone(),
        ctx,
    )
    .await
    .map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Failed to bind signaling server");
        e
    })?;
    let signaling_token = shutdown_token.child_token();
    let signaling_task = tokio::spawn(signaling.run(signaling_token.clone()));

    info!("RTSP Relay running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_draining();

    signaling_token.cancel();
    if let Err(e) = signaling_task.await {
        warn!(error = %e, "Signaling server task failed");
    }

    match registry.drain(DRAIN_DEADLINE).await {
        Ok(true) => info!("All sessions released"),
        Ok(false) => warn!(
            deadline_secs = DRAIN_DEADLINE.as_secs(),
            "Sessions still active at drain deadline"
        ),
        Err(e) => warn!(error = %e, "Session drain failed"),
    }
    registry.cancel();
    if let Err(e) = registry_task.await {
        warn!(error = %e, "Session registry task failed");
    }

    engine_client.shutdown().await;
    shutdown_token.cancel();

    info!("RTSP Relay shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
