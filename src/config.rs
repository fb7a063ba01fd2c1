//! Client configuration
//!
//! All tunables live in an explicit [`ClientConfig`] passed into the
//! constructors; there is no process-wide mutable state. Every field has a
//! documented default so a config file or builder only names what it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::address::Dialect;
use crate::transport::Qos;

/// Configuration errors for loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Messaging client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Broker URL, e.g. `mqtt://localhost:1883` or `amqp://localhost:5672/%2f`.
    pub endpoint: String,

    /// Environment variable containing the broker username.
    #[serde(default)]
    pub username_env: Option<String>,

    /// Environment variable containing the broker password.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Connect attempts before `connect` gives up (default: 10).
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Delay between connect/reconnect attempts in milliseconds (default: 500).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Quality of service for published messages (default: at_least_once).
    #[serde(default)]
    pub publish_qos: Qos,

    /// Quality of service for subscriptions (default: at_least_once).
    #[serde(default)]
    pub subscribe_qos: Qos,

    /// Unacknowledged delivery window, queue/exchange transport only
    /// (default: 0 = broker default).
    #[serde(default)]
    pub prefetch_count: u16,

    /// Prefetch window in bytes, queue/exchange transport only (default: 0).
    #[serde(default)]
    pub prefetch_size: u32,

    /// Whether to start each session without persisted broker state
    /// (default: true).
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,

    /// Keep-alive interval in seconds (default: 60).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Root certificate bundle for TLS endpoints (default: system roots).
    #[serde(default)]
    pub tls_root_cert: Option<PathBuf>,

    /// Topic exchange to bind against, queue/exchange transport only
    /// (default: `amq.topic`).
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Capacity of each subscription's internal dispatch queue; a full queue
    /// blocks the transport-side forwarder (default: 16).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Prefix for generated broker client identifiers (default: `lorabus`).
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

fn default_connect_retries() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_exchange() -> String {
    "amq.topic".to_string()
}

fn default_queue_capacity() -> usize {
    16
}

fn default_client_id_prefix() -> String {
    "lorabus".to_string()
}

impl ClientConfig {
    /// Configuration with documented defaults for the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        ClientConfig {
            endpoint: endpoint.into(),
            username_env: None,
            password_env: None,
            connect_retries: default_connect_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            publish_qos: Qos::default(),
            subscribe_qos: Qos::default(),
            prefetch_count: 0,
            prefetch_size: 0,
            clean_session: default_clean_session(),
            keep_alive_secs: default_keep_alive_secs(),
            tls_root_cert: None,
            exchange: default_exchange(),
            queue_capacity: default_queue_capacity(),
            client_id_prefix: default_client_id_prefix(),
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".into()));
        }
        if self.connect_retries == 0 {
            return Err(ConfigError::Invalid(
                "connect_retries must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Resolves credentials from the configured environment variables.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username_env = self.username_env.as_ref()?;
        let username = std::env::var(username_env).ok()?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|env_name| std::env::var(env_name).ok())
            .unwrap_or_default();
        Some((username, password))
    }

    /// Dialect implied by the endpoint scheme; bindings may override.
    pub fn dialect_hint(&self) -> Dialect {
        if self.endpoint.starts_with("amqp") {
            Dialect::Amqp
        } else {
            Dialect::Mqtt
        }
    }
}
