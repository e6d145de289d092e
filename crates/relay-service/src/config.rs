//! Relay service configuration.
//!
//! Configuration is loaded from environment variables. The RTSP source URL
//! usually embeds camera credentials, so it is held as a `SecretString` and
//! redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default media engine control endpoint.
pub const DEFAULT_ENGINE_URL: &str = "ws://localhost:8888/kurento";

/// Default signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default WebSocket path accepted by the signaling gateway.
pub const DEFAULT_SIGNALING_PATH: &str = "/kurento";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default bound on a single engine dial attempt, in seconds.
pub const DEFAULT_ENGINE_CONNECT_TIMEOUT_SECONDS: u64 = 30;

/// Default number of dial attempts per connection request.
pub const DEFAULT_ENGINE_CONNECT_RETRIES: u32 = 5;

/// Default delay between dial attempts, in milliseconds.
pub const DEFAULT_ENGINE_CONNECT_RETRY_DELAY_MS: u64 = 3000;

/// Default bound on a single engine control request, in seconds.
pub const DEFAULT_ENGINE_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Default fixed interval between reconnection attempts, in seconds.
pub const DEFAULT_ENGINE_RECONNECT_INTERVAL_SECONDS: u64 = 5;

/// Default maximum number of concurrently active sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// What to do when the source endpoint fails to start playback after the
/// SDP exchange already succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayFailurePolicy {
    /// Report the failure to the client and keep the session alive.
    #[default]
    Report,
    /// Report the failure and tear the session down.
    Terminate,
}

impl FromStr for PlayFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "terminate" => Ok(Self::Terminate),
            other => Err(ConfigError::InvalidValue(format!(
                "RELAY_PLAY_FAILURE_POLICY must be 'report' or 'terminate', got '{other}'"
            ))),
        }
    }
}

/// Relay service configuration.
#[derive(Clone)]
pub struct Config {
    /// Media engine control endpoint (Kurento JSON-RPC over WebSocket).
    pub engine_url: String,

    /// RTSP origin handed to the engine's source endpoint.
    /// Protected by `SecretString` to prevent accidental logging.
    pub source_url: SecretString,

    /// Signaling gateway bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// WebSocket path accepted by the signaling gateway (default: "/kurento").
    pub signaling_path: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Bound on a single engine dial attempt.
    pub engine_connect_timeout: Duration,

    /// Dial attempts made by one connection request before giving up.
    pub engine_connect_retries: u32,

    /// Delay between dial attempts.
    pub engine_connect_retry_delay: Duration,

    /// Bound on a single engine control request.
    pub engine_request_timeout: Duration,

    /// Fixed interval of the reconnection loop.
    pub engine_reconnect_interval: Duration,

    /// Optional cap on reconnection attempts (`None` retries indefinitely).
    pub engine_reconnect_max_attempts: Option<u32>,

    /// Play failure handling.
    pub play_failure_policy: PlayFailurePolicy,

    /// Maximum concurrently active sessions.
    pub max_sessions: usize,
}

/// Custom Debug implementation that redacts the source URL.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("engine_url", &self.engine_url)
            .field("source_url", &"[REDACTED]")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("signaling_path", &self.signaling_path)
            .field("health_bind_address", &self.health_bind_address)
            .field("engine_connect_timeout", &self.engine_connect_timeout)
            .field("engine_connect_retries", &self.engine_connect_retries)
            .field("engine_connect_retry_delay", &self.engine_connect_retry_delay)
            .field("engine_request_timeout", &self.engine_request_timeout)
            .field("engine_reconnect_interval", &self.engine_reconnect_interval)
            .field(
                "engine_reconnect_max_attempts",
                &self.engine_reconnect_max_attempts,
            )
            .field("play_failure_policy", &self.play_failure_policy)
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let source_url = SecretString::from(
            vars.get("RTSP_URL")
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar("RTSP_URL".to_string()))?
                .trim()
                .to_string(),
        );

        let engine_url = vars
            .get("KURENTO_WS_URL")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| DEFAULT_ENGINE_URL.to_string());

        if !(engine_url.starts_with("ws://") || engine_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "KURENTO_WS_URL must be a ws:// or wss:// URL, got '{engine_url}'"
            )));
        }

        // PORT keeps compatibility with the usual container convention
        let signaling_bind_address = match (
            vars.get("RELAY_SIGNALING_BIND_ADDRESS"),
            vars.get("PORT"),
        ) {
            (Some(addr), _) => addr.clone(),
            (None, Some(port)) => {
                let port: u16 = parse_value("PORT", port)?;
                format!("0.0.0.0:{port}")
            }
            (None, None) => DEFAULT_SIGNALING_BIND_ADDRESS.to_string(),
        };

        let signaling_path = vars
            .get("RELAY_SIGNALING_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_PATH.to_string());

        if !signaling_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_SIGNALING_PATH must start with '/', got '{signaling_path}'"
            )));
        }

        let health_bind_address = vars
            .get("RELAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let engine_connect_timeout = Duration::from_secs(parse_or(
            vars,
            "ENGINE_CONNECT_TIMEOUT_SECONDS",
            DEFAULT_ENGINE_CONNECT_TIMEOUT_SECONDS,
        )?);

        let engine_connect_retries = parse_or(
            vars,
            "ENGINE_CONNECT_RETRIES",
            DEFAULT_ENGINE_CONNECT_RETRIES,
        )?;
        if engine_connect_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "ENGINE_CONNECT_RETRIES must be at least 1".to_string(),
            ));
        }

        let engine_connect_retry_delay = Duration::from_millis(parse_or(
            vars,
            "ENGINE_CONNECT_RETRY_DELAY_MS",
            DEFAULT_ENGINE_CONNECT_RETRY_DELAY_MS,
        )?);

        let engine_request_timeout = Duration::from_secs(parse_or(
            vars,
            "ENGINE_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_ENGINE_REQUEST_TIMEOUT_SECONDS,
        )?);

        let engine_reconnect_interval = Duration::from_secs(parse_or(
            vars,
            "ENGINE_RECONNECT_INTERVAL_SECONDS",
            DEFAULT_ENGINE_RECONNECT_INTERVAL_SECONDS,
        )?);

        let engine_reconnect_max_attempts = vars
            .get("ENGINE_RECONNECT_MAX_ATTEMPTS")
            .map(|s| parse_value("ENGINE_RECONNECT_MAX_ATTEMPTS", s))
            .transpose()?;

        let play_failure_policy = vars
            .get("RELAY_PLAY_FAILURE_POLICY")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or_default();

        let max_sessions = parse_or(vars, "RELAY_MAX_SESSIONS", DEFAULT_MAX_SESSIONS)?;

        Ok(Config {
            engine_url,
            source_url,
            signaling_bind_address,
            signaling_path,
            health_bind_address,
            engine_connect_timeout,
            engine_connect_retries,
            engine_connect_retry_delay,
            engine_request_timeout,
            engine_reconnect_interval,
            engine_reconnect_max_attempts,
            play_failure_policy,
            max_sessions,
        })
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{name} has invalid value '{raw}'")))
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    vars.get(name)
        .map_or(Ok(default), |raw| parse_value(name, raw))
}
