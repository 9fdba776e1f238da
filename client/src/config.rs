//! Configuration management for the sync runtime.

use std::env;
use std::time::Duration;

use codex_sync_engine::{
    pending::{DEFAULT_CAPACITY, DEFAULT_WARN_THRESHOLD},
    DEFAULT_PREFIX,
};

/// Sync configuration, loaded from environment variables or built in code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Prefix of every persisted key
    pub key_prefix: String,
    /// Upper bound on any single remote call
    pub remote_timeout: Duration,
    /// Maximum number of queued publishes
    pub queue_capacity: usize,
    /// Queue depth past which enqueues report a backlog
    pub queue_warn_threshold: usize,
    /// Artificial delay added to local storage operations (zero disables it)
    pub local_latency: Duration,
    /// Capacity of the observer event buffer
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_PREFIX.to_string(),
            remote_timeout: Duration::from_secs(10),
            queue_capacity: DEFAULT_CAPACITY,
            queue_warn_threshold: DEFAULT_WARN_THRESHOLD,
            local_latency: Duration::ZERO,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Load a `.env` file if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Unset variables fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let key_prefix = lookup("CODEX_SYNC_PREFIX").unwrap_or(defaults.key_prefix);
        if key_prefix.contains(':') {
            return Err(ConfigError::InvalidPrefix(key_prefix));
        }

        let remote_timeout = parse_var(&lookup, "CODEX_SYNC_REMOTE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.remote_timeout);
        if remote_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "CODEX_SYNC_REMOTE_TIMEOUT_MS",
                value: "0".to_string(),
            });
        }

        let queue_capacity =
            parse_var(&lookup, "CODEX_SYNC_QUEUE_CAPACITY")?.unwrap_or(defaults.queue_capacity);
        let queue_warn_threshold =
            parse_var(&lookup, "CODEX_SYNC_QUEUE_WARN")?.unwrap_or(defaults.queue_warn_threshold);
        let local_latency = parse_var(&lookup, "CODEX_SYNC_LATENCY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.local_latency);
        let event_buffer = parse_var::<usize, _>(&lookup, "CODEX_SYNC_EVENT_BUFFER")?
            .unwrap_or(defaults.event_buffer)
            .max(1);

        Ok(Self {
            key_prefix,
            remote_timeout,
            queue_capacity,
            queue_warn_threshold,
            local_latency,
            event_buffer,
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },

    #[error("Key prefix {0:?} must not contain ':'")]
    InvalidPrefix(String),
}
