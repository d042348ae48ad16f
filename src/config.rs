//! Storage configuration.
//!
//! A `StorageConfig` starts from defaults and can be overridden by
//! environment variables ([`StorageConfig::from_env`]) or loaded from a YAML
//! file ([`StorageConfig::from_yaml_file`]). Durations are written in
//! milliseconds in YAML, except `discard_ttl_secs`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::{DEFAULT_LEASE, DEFAULT_RETRY_INTERVAL};
use crate::queue::{QueueFullPolicy, QueueSettings, DEFAULT_QUEUE_CAPACITY};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Which lock, queue and task store backends a service runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process locks, queues and task store.
    #[default]
    Local,
    /// Redis locks and queues with a PostgreSQL task store.
    Distributed,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Distributed => write!(f, "distributed"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" => Ok(BackendKind::Local),
            "distributed" | "redis" => Ok(BackendKind::Distributed),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Configuration of a `QueryStorageService`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Redis connection URL for the distributed lock and queue backends.
    pub redis_url: String,
    /// PostgreSQL connection URL for the distributed task store.
    pub database_url: String,
    /// Prefix of every Redis key.
    pub key_prefix: String,

    // Queue settings
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    #[serde(rename = "send_timeout_ms", with = "duration_ms")]
    pub send_timeout: Duration,
    pub listener_buffer: usize,
    #[serde(rename = "listener_poll_interval_ms", with = "duration_ms")]
    pub listener_poll_interval: Duration,
    /// Wait of `Listener::receive` when no explicit wait is given.
    #[serde(rename = "receive_wait_ms", with = "duration_ms")]
    pub receive_wait: Duration,

    // Lock settings
    #[serde(rename = "lock_lease_ms", with = "duration_ms")]
    pub lock_lease: Duration,
    #[serde(rename = "lock_retry_interval_ms", with = "duration_ms")]
    pub lock_retry_interval: Duration,

    /// Upper bound of the PostgreSQL connection pool.
    pub max_connections: u32,
    /// How long notifications of a deleted query stay suppressed.
    #[serde(rename = "discard_ttl_secs", with = "duration_secs")]
    pub discard_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgres://localhost/query_storage".to_string(),
            key_prefix: "query-storage".to_string(),

            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_full_policy: QueueFullPolicy::Block,
            send_timeout: Duration::from_secs(5),
            listener_buffer: 100,
            listener_poll_interval: Duration::from_millis(100),
            receive_wait: Duration::from_secs(1),

            lock_lease: DEFAULT_LEASE,
            lock_retry_interval: DEFAULT_RETRY_INTERVAL,

            max_connections: 10,
            discard_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl StorageConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUERY_STORAGE_BACKEND`: `local` or `distributed` (default: local)
    /// - `QUERY_STORAGE_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `DATABASE_URL`: PostgreSQL URL (default: postgres://localhost/query_storage)
    /// - `QUERY_STORAGE_KEY_PREFIX`: Redis key prefix (default: query-storage)
    /// - `QUERY_STORAGE_QUEUE_CAPACITY`: Pool queue capacity (default: 10)
    /// - `QUERY_STORAGE_QUEUE_FULL_POLICY`: `block` or `fail_fast` (default: block)
    /// - `QUERY_STORAGE_SEND_TIMEOUT_MS`: Blocking send window (default: 5000)
    /// - `QUERY_STORAGE_LISTENER_BUFFER`: Listener buffer size (default: 100)
    /// - `QUERY_STORAGE_LISTENER_POLL_MS`: Listener poll interval (default: 100)
    /// - `QUERY_STORAGE_RECEIVE_WAIT_MS`: Default receive wait (default: 1000)
    /// - `QUERY_STORAGE_LOCK_LEASE_MS`: Task lock lease (default: 300000)
    /// - `QUERY_STORAGE_LOCK_RETRY_MS`: Lock retry interval (default: 25)
    /// - `QUERY_STORAGE_MAX_CONNECTIONS`: PostgreSQL pool size (default: 10)
    /// - `QUERY_STORAGE_DISCARD_TTL_SECS`: Discard marker lifetime (default: 86400)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// result does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("QUERY_STORAGE_BACKEND") {
            config.backend = parse_env_value(&val, "QUERY_STORAGE_BACKEND")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("DATABASE_URL") {
            config.database_url = val;
        }

        if let Some(val) = lookup("QUERY_STORAGE_KEY_PREFIX") {
            config.key_prefix = val;
        }

        // Queue settings
        if let Some(val) = lookup("QUERY_STORAGE_QUEUE_CAPACITY") {
            config.queue_capacity = parse_env_value(&val, "QUERY_STORAGE_QUEUE_CAPACITY")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_QUEUE_FULL_POLICY") {
            config.queue_full_policy = parse_env_value(&val, "QUERY_STORAGE_QUEUE_FULL_POLICY")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_SEND_TIMEOUT_MS") {
            config.send_timeout = parse_env_millis(&val, "QUERY_STORAGE_SEND_TIMEOUT_MS")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_LISTENER_BUFFER") {
            config.listener_buffer = parse_env_value(&val, "QUERY_STORAGE_LISTENER_BUFFER")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_LISTENER_POLL_MS") {
            config.listener_poll_interval =
                parse_env_millis(&val, "QUERY_STORAGE_LISTENER_POLL_MS")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_RECEIVE_WAIT_MS") {
            config.receive_wait = parse_env_millis(&val, "QUERY_STORAGE_RECEIVE_WAIT_MS")?;
        }

        // Lock settings
        if let Some(val) = lookup("QUERY_STORAGE_LOCK_LEASE_MS") {
            config.lock_lease = parse_env_millis(&val, "QUERY_STORAGE_LOCK_LEASE_MS")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_LOCK_RETRY_MS") {
            config.lock_retry_interval = parse_env_millis(&val, "QUERY_STORAGE_LOCK_RETRY_MS")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_MAX_CONNECTIONS") {
            config.max_connections = parse_env_value(&val, "QUERY_STORAGE_MAX_CONNECTIONS")?;
        }

        if let Some(val) = lookup("QUERY_STORAGE_DISCARD_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "QUERY_STORAGE_DISCARD_TTL_SECS")?;
            config.discard_ttl = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML configuration file. Missing keys keep
    /// their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.listener_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "listener_buffer must be greater than 0".to_string(),
            ));
        }

        if self.listener_poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "listener_poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.lock_lease.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "lock_lease must be greater than 0".to_string(),
            ));
        }

        if self.lock_retry_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "lock_retry_interval must be greater than 0".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.backend == BackendKind::Distributed {
            if self.redis_url.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "redis_url cannot be empty".to_string(),
                ));
            }
            if self.database_url.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "database_url cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Queue tunables derived from this configuration.
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            capacity: self.queue_capacity,
            full_policy: self.queue_full_policy,
            send_timeout: self.send_timeout,
            listener_buffer: self.listener_buffer,
            poll_interval: self.listener_poll_interval,
            receive_wait: self.receive_wait,
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_queue_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.queue_full_policy = policy;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_listener_buffer(mut self, buffer: usize) -> Self {
        self.listener_buffer = buffer;
        self
    }

    pub fn with_listener_poll_interval(mut self, interval: Duration) -> Self {
        self.listener_poll_interval = interval;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_discard_ttl(mut self, ttl: Duration) -> Self {
        self.discard_ttl = ttl;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
{
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_env_millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let millis: u64 = parse_env_value(value, key)?;
    Ok(Duration::from_millis(millis))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
