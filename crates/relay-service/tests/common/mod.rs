//! Relay harness for integration tests.
//!
//! Wires the production components together (Kurento adapter, engine
//! client, session registry, signaling gateway) against a `MockEngine`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_service::actors::{
    ActorMetrics, RelayContext, SessionRegistryActor, SessionRegistryHandle, SessionSettings,
};
use relay_service::config::Config;
use relay_service::engine::{EngineClient, EngineClientConfig, EngineStatus, KurentoEngine};
use relay_service::signaling::SignalingServer;
use relay_test_utils::{relay_env, TestSignalingClient};
use tokio_util::sync::CancellationToken;

pub struct TestRelay {
    pub url: String,
    pub config: Config,
    pub engine_client: EngineClient,
    pub registry: SessionRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    cancel: CancellationToken,
}

impl TestRelay {
    /// Relay pointed at `engine_url` with test defaults.
    pub async fn start(engine_url: &str) -> Self {
        Self::start_with(engine_url, &[]).await
    }

    /// Relay with extra environment overrides.
    pub async fn start_with(engine_url: &str, overrides: &[(&str, &str)]) -> Self {
        let mut env: HashMap<String, String> = relay_env(engine_url);
        for (key, value) in overrides {
            env.insert((*key).to_string(), (*value).to_string());
        }
        let config = Config::from_vars(&env).expect("test config should be valid");

        let engine_client = EngineClient::new(EngineClientConfig::from_config(&config));
        let metrics = ActorMetrics::new();
        let (registry, _registry_task) =
            SessionRegistryActor::spawn(config.max_sessions, Arc::clone(&metrics));

        let ctx = RelayContext {
            engine: Arc::new(KurentoEngine::new(engine_client.clone())),
            registry: registry.clone(),
            settings: Arc::new(SessionSettings::from_config(&config)),
            metrics: Arc::clone(&metrics),
        };

        let server = SignalingServer::bind(
            &config.signaling_bind_address,
            config.signaling_path.clone(),
            ctx,
        )
        .await
        .expect("signaling server should bind");
        let addr = server.local_addr().expect("bound address");
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        Self {
            url: format!("ws://{addr}{}", config.signaling_path),
            config,
            engine_client,
            registry,
            metrics,
            cancel,
        }
    }

    pub async fn client(&self) -> TestSignalingClient {
        TestSignalingClient::connect(&self.url)
            .await
            .expect("client should connect")
    }

    pub async fn session_count(&self) -> usize {
        self.registry
            .get_status()
            .await
            .expect("registry should answer")
            .session_count
    }

    /// Wait until the registry holds exactly `n` sessions.
    pub async fn wait_for_sessions(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.session_count().await == n {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until the engine client reports `status`.
    pub async fn wait_for_engine(&self, status: EngineStatus, timeout: Duration) -> bool {
        let mut rx = self.engine_client.subscribe_status();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == status))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.registry.cancel();
        self.engine_client.shutdown().await;
    }
}
