//! Process-wide media engine client.
//!
//! Owns the single shared [`EngineConnection`]. `get_connection` is
//! single-flight: concurrent callers during a dial wait on the same attempt
//! and all receive the resulting connection. On unexpected transport loss the
//! cached connection is cleared, status drops to `Disconnected`, and one
//! reconnection loop runs on a fixed interval until a dial succeeds.

use super::connection::EngineConnection;
use crate::config::Config;
use crate::errors::EngineError;
use crate::observability::metrics;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Connectivity state of the shared engine connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnection loop policy: fixed interval, optional attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    /// `None` retries until shutdown.
    pub max_attempts: Option<u32>,
}

/// Engine client settings.
#[derive(Debug, Clone)]
pub struct EngineClientConfig {
    pub url: String,
    pub connect_timeout: Duration,
    /// Dial attempts inside one `get_connection` call.
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl EngineClientConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.engine_url.clone(),
            connect_timeout: config.engine_connect_timeout,
            connect_retries: config.engine_connect_retries,
            connect_retry_delay: config.engine_connect_retry_delay,
            request_timeout: config.engine_request_timeout,
            reconnect: ReconnectPolicy {
                interval: config.engine_reconnect_interval,
                max_attempts: config.engine_reconnect_max_attempts,
            },
        }
    }
}

struct Inner {
    config: EngineClientConfig,
    current: RwLock<Option<Arc<EngineConnection>>>,
    dial_lock: Mutex<()>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    status: watch::Sender<EngineStatus>,
    epoch: AtomicU64,
    reconnect_loops: AtomicU64,
    shutdown: CancellationToken,
}

/// Puts status back to `Disconnected` when a dial ends without installing
/// a connection, including when the dialing caller is dropped mid-attempt.
struct DialStatus<'a> {
    status: &'a watch::Sender<EngineStatus>,
    connected: bool,
}

impl Drop for DialStatus<'_> {
    fn drop(&mut self) {
        if !self.connected {
            self.status.send_replace(EngineStatus::Disconnected);
        }
    }
}

/// Cheaply cloneable handle to the shared engine client.
#[derive(Clone)]
pub struct EngineClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineClient")
            .field("url", &self.inner.config.url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl EngineClient {
    /// Create a client. No connection is made until first use.
    #[must_use]
    pub fn new(config: EngineClientConfig) -> Self {
        let (status, _) = watch::channel(EngineStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                current: RwLock::new(None),
                dial_lock: Mutex::new(()),
                reconnect_task: Mutex::new(None),
                status,
                epoch: AtomicU64::new(0),
                reconnect_loops: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        *self.inner.status.borrow()
    }

    /// Subscribe to connectivity changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.subscribe()
    }

    /// Number of reconnection loops started since creation.
    #[must_use]
    pub fn reconnect_loops_started(&self) -> u64 {
        self.inner.reconnect_loops.load(Ordering::SeqCst)
    }

    /// Return the live connection, dialing if there is none.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unreachable` once the dial retry budget is spent,
    /// or `NotConnected` after shutdown.
    #[instrument(skip_all, name = "engine.get_connection")]
    pub async fn get_connection(&self) -> Result<Arc<EngineConnection>, EngineError> {
        if let Some(conn) = self.live().await {
            return Ok(conn);
        }

        let _guard = self.inner.dial_lock.lock().await;
        if let Some(conn) = self.live().await {
            return Ok(conn);
        }
        self.dial(self.inner.config.connect_retries.max(1)).await
    }

    /// Return the live connection only if it is the one that created objects
    /// of `epoch`. Object ids do not survive a reconnection.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if disconnected or the connection has changed.
    pub async fn connection_for(&self, epoch: u64) -> Result<Arc<EngineConnection>, EngineError> {
        match self.live().await {
            Some(conn) if conn.epoch() == epoch => Ok(conn),
            _ => Err(EngineError::NotConnected),
        }
    }

    /// Return the live connection without dialing.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if there is no live connection.
    pub async fn current(&self) -> Result<Arc<EngineConnection>, EngineError> {
        self.live().await.ok_or(EngineError::NotConnected)
    }

    /// Stop reconnecting and close the connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(task) = self.inner.reconnect_task.lock().await.take() {
            task.abort();
        }
        if let Some(conn) = self.inner.current.write().await.take() {
            conn.close();
        }
        self.inner.status.send_replace(EngineStatus::Disconnected);
        info!(target: "relay.engine.client", "Engine client shut down");
    }

    async fn live(&self) -> Option<Arc<EngineConnection>> {
        self.inner
            .current
            .read()
            .await
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// Dial up to `attempts` times. Caller must hold `dial_lock`.
    async fn dial(&self, attempts: u32) -> Result<Arc<EngineConnection>, EngineError> {
        let config = &self.inner.config;
        self.inner.status.send_replace(EngineStatus::Connecting);
        let mut status = DialStatus {
            status: &self.inner.status,
            connected: false,
        };

        let mut last_error = EngineError::NotConnected;
        for attempt in 1..=attempts {
            if self.inner.shutdown.is_cancelled() {
                break;
            }

            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            match EngineConnection::open(
                &config.url,
                epoch,
                config.connect_timeout,
                config.request_timeout,
            )
            .await
            {
                Ok(conn) => {
                    self.install(Arc::clone(&conn)).await;
                    status.connected = true;
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(
                        target: "relay.engine.client",
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Media engine dial failed"
                    );
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    () = self.inner.shutdown.cancelled() => break,
                    () = tokio::time::sleep(config.connect_retry_delay) => {}
                }
            }
        }

        Err(last_error)
    }

    async fn install(&self, conn: Arc<EngineConnection>) {
        let epoch = conn.epoch();
        let closed = conn.closed();
        *self.inner.current.write().await = Some(conn);
        self.inner.status.send_replace(EngineStatus::Connected);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(inner) = weak.upgrade() {
                EngineClient { inner }.on_disconnected(epoch).await;
            }
        });
    }

    async fn on_disconnected(&self, epoch: u64) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        {
            let mut current = self.inner.current.write().await;
            match current.as_ref() {
                Some(conn) if conn.epoch() == epoch => *current = None,
                _ => return,
            }
        }

        self.inner.status.send_replace(EngineStatus::Disconnected);
        warn!(
            target: "relay.engine.client",
            epoch,
            "Lost connection to media engine"
        );
        self.start_reconnect_loop().await;
    }

    /// Start the reconnection loop unless one is already running.
    async fn start_reconnect_loop(&self) {
        let mut task = self.inner.reconnect_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!(target: "relay.engine.client", "Reconnection loop already running");
            return;
        }

        let loops = self.inner.reconnect_loops.fetch_add(1, Ordering::SeqCst) + 1;
        let policy = self.inner.config.reconnect;
        info!(
            target: "relay.engine.client",
            interval_ms = policy.interval.as_millis(),
            max_attempts = ?policy.max_attempts,
            loops,
            "Starting media engine reconnection loop"
        );

        *task = Some(tokio::spawn(self.clone().reconnect_loop(policy)));
    }

    /// Boxed so the dial -> install -> watcher -> reconnect chain has a
    /// nameable type.
    fn reconnect_loop(self, policy: ReconnectPolicy) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut attempts: u32 = 0;
            loop {
                tokio::select! {
                    () = self.inner.shutdown.cancelled() => return,
                    () = tokio::time::sleep(policy.interval) => {}
                }
                attempts = attempts.saturating_add(1);

                let result = {
                    let _guard = self.inner.dial_lock.lock().await;
                    match self.live().await {
                        Some(conn) => Ok(conn),
                        None => self.dial(1).await,
                    }
                };

                match result {
                    Ok(conn) => {
                        metrics::record_engine_reconnect();
                        info!(
                            target: "relay.engine.client",
                            attempts,
                            epoch = conn.epoch(),
                            "Reconnected to media engine"
                        );
                        return;
                    }
                    Err(e) => {
                        if policy.max_attempts.is_some_and(|max| attempts >= max) {
                            error!(
                                target: "relay.engine.client",
                                attempts,
                                error = %e,
                                "Giving up on media engine reconnection"
                            );
                            return;
                        }
                        debug!(
                            target: "relay.engine.client",
                            attempts,
                            error = %e,
                            "Reconnection attempt failed"
                        );
                    }
                }
            }
        })
    }
}
