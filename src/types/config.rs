//! Configuration structures.
//!
//! Every section has defaults; a partial JSON document overrides only the keys
//! it names.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Client session manager configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Wire frame limits shared by both sides.
    #[serde(default)]
    pub limits: FrameLimits,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values that would make the client or server unusable.
    pub fn validate(&self) -> Result<()> {
        if self.client.address.is_empty() {
            return Err(Error::config("client.address must not be empty"));
        }
        if self.client.session_num == 0 {
            return Err(Error::config("client.session_num must be at least 1"));
        }
        if self.client.max_streams == 0 {
            return Err(Error::config("client.max_streams must be at least 1"));
        }
        if self.server.max_connections == 0 || self.server.max_concurrent_streams == 0 {
            return Err(Error::config(
                "server.max_connections and server.max_concurrent_streams must be at least 1",
            ));
        }
        if self.limits.max_method_name_len == 0 {
            return Err(Error::config("limits.max_method_name_len must be at least 1"));
        }
        Ok(())
    }
}

/// Client-side session manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address of the server (socket path, `host:port`, or in-process name).
    pub address: String,

    /// Number of transport sessions the pool spreads streams across.
    pub session_num: usize,

    /// Maximum number of streams leased at the same time.
    pub max_streams: usize,

    /// Bound on establishing the session manager.
    #[serde(with = "humantime_serde")]
    pub initialize_timeout: Duration,

    /// Bound on waiting for a free stream when the pool is exhausted.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Per-stream pipe capacity for the in-process transport.
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:50061".to_string(),
            session_num: 1,
            max_streams: 256,
            initialize_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            buffer_size: 64 * 1024,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address used by the listener helpers.
    pub listen_addr: String,

    /// Maximum connections served at once. Connections over the limit are
    /// closed as soon as they are accepted.
    pub max_connections: usize,

    /// Maximum streams dispatched at once across all connections.
    pub max_concurrent_streams: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50061".to_string(),
            max_connections: 1000,
            max_concurrent_streams: 4096,
        }
    }
}

/// Upper bounds on length-prefixed wire fields.
///
/// Length prefixes are checked before any buffer is sized; a prefix over its
/// bound fails the read immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLimits {
    /// Maximum method identifier length (`Service.Method`) in bytes.
    pub max_method_name_len: u16,

    /// Maximum error message length in bytes. Longer messages are truncated
    /// by the server and rejected by the client.
    pub max_error_message_len: u32,

    /// Maximum size of any single read from a stream.
    pub max_payload_len: usize,
}

impl FrameLimits {
    /// Smallest error message bound honoured, so a truncated message can
    /// never become empty (an empty error field means "reply follows").
    pub const MIN_ERROR_MESSAGE_LEN: usize = 64;

    /// Effective error message bound in bytes.
    pub fn error_message_limit(&self) -> usize {
        usize::try_from(self.max_error_message_len)
            .unwrap_or(usize::MAX)
            .max(Self::MIN_ERROR_MESSAGE_LEN)
    }
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_method_name_len: 1024,
            max_error_message_len: 64 * 1024,
            max_payload_len: 64 * 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
