//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (prefix `CORELINK_`)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Server / listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-session protocol tuning
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// OTA flash configuration
    #[serde(default)]
    pub flash: FlashConfig,
}

impl CoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| CoreError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("CORELINK_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("CORELINK_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(server_id) = std::env::var("CORELINK_SERVER_ID") {
            config.server.server_id = server_id;
        }
        if let Ok(val) = std::env::var("CORELINK_SOCKET_TIMEOUT_SECS") {
            if let Ok(val) = val.parse() {
                config.server.socket_timeout_secs = val;
            }
        }
        if let Ok(val) = std::env::var("CORELINK_CHUNK_SIZE") {
            if let Ok(val) = val.parse() {
                config.flash.chunk_size = val;
            }
        }

        config
    }

    /// Merge with another config (other takes precedence for non-default fields)
    pub fn merge(self, other: Self) -> Self {
        let server_defaults = ServerConfig::default();
        let protocol_defaults = ProtocolConfig::default();
        let flash_defaults = FlashConfig::default();
        Self {
            server: ServerConfig {
                host: pick(other.server.host, self.server.host, &server_defaults.host),
                port: pick(other.server.port, self.server.port, &server_defaults.port),
                server_id: pick(
                    other.server.server_id,
                    self.server.server_id,
                    &server_defaults.server_id,
                ),
                socket_timeout_secs: pick(
                    other.server.socket_timeout_secs,
                    self.server.socket_timeout_secs,
                    &server_defaults.socket_timeout_secs,
                ),
                keepalive_secs: pick(
                    other.server.keepalive_secs,
                    self.server.keepalive_secs,
                    &server_defaults.keepalive_secs,
                ),
            },
            protocol: ProtocolConfig {
                listener_timeout_secs: pick(
                    other.protocol.listener_timeout_secs,
                    self.protocol.listener_timeout_secs,
                    &protocol_defaults.listener_timeout_secs,
                ),
                token_ttl_secs: pick(
                    other.protocol.token_ttl_secs,
                    self.protocol.token_ttl_secs,
                    &protocol_defaults.token_ttl_secs,
                ),
            },
            flash: FlashConfig {
                chunk_size: pick(
                    other.flash.chunk_size,
                    self.flash.chunk_size,
                    &flash_defaults.chunk_size,
                ),
                max_binary_size: pick(
                    other.flash.max_binary_size,
                    self.flash.max_binary_size,
                    &flash_defaults.max_binary_size,
                ),
                chunk_retry_limit: pick(
                    other.flash.chunk_retry_limit,
                    self.flash.chunk_retry_limit,
                    &flash_defaults.chunk_retry_limit,
                ),
                chunk_ack_timeout_secs: pick(
                    other.flash.chunk_ack_timeout_secs,
                    self.flash.chunk_ack_timeout_secs,
                    &flash_defaults.chunk_ack_timeout_secs,
                ),
            },
        }
    }
}

/// `preferred` wins when it was explicitly changed from the default.
fn pick<T: PartialEq>(preferred: T, fallback: T, default: &T) -> T {
    if preferred != *default {
        preferred
    } else {
        fallback
    }
}

/// Listener / socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Identifier reported to the cluster routing sidechannel
    pub server_id: String,

    /// Idle socket timeout in seconds
    pub socket_timeout_secs: u64,

    /// TCP keepalive interval in seconds
    pub keepalive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5683,
            server_id: "corelink-1".to_string(),
            socket_timeout_secs: 90,
            keepalive_secs: 15,
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Idle socket timeout as a `Duration`
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

/// Per-session protocol tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Default timeout for response listeners, in seconds
    pub listener_timeout_secs: u64,

    /// Age after which a pending token slot may be reclaimed, in seconds.
    /// Must not be shorter than the listener timeout, or a live waiter's
    /// slot could be freed under it.
    pub token_ttl_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            listener_timeout_secs: 15,
            token_ttl_secs: 15,
        }
    }
}

impl ProtocolConfig {
    /// Listener timeout as a `Duration`
    pub fn listener_timeout(&self) -> Duration {
        Duration::from_secs(self.listener_timeout_secs)
    }

    /// Token slot TTL as a `Duration`
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// OTA flash configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Chunk size in bytes; capped by the device-reported OTA chunk size
    pub chunk_size: usize,

    /// Largest accepted firmware binary, in bytes
    pub max_binary_size: usize,

    /// Retransmissions allowed per chunk before the transfer fails
    pub chunk_retry_limit: u32,

    /// Seconds to wait for each ChunkReceived before retransmitting
    pub chunk_ack_timeout_secs: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            max_binary_size: 512 * 1024,
            chunk_retry_limit: 3,
            chunk_ack_timeout_secs: 15,
        }
    }
}

impl FlashConfig {
    /// Chunk ack timeout as a `Duration`
    pub fn chunk_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_ack_timeout_secs)
    }
}
