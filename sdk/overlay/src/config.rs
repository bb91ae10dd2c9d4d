//! SDK configuration.
//!
//! Configuration can be loaded from a JSON file, taken from defaults, or
//! assembled in code. Environment variables override file values so
//! deployments can retune a packaged application without editing it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use overlay_wire::DEFAULT_MAX_MESSAGE_SIZE;

/// Configuration load failures
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Channel tuning
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Seconds allowed for the TCP connect to an edge router
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// TLS material for router connections, plain TCP when absent
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Channel tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Largest message accepted or produced on the wire
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Outbound queue depth before senders are backpressured
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
    /// Seconds allowed for the hello exchange after connect
    #[serde(default = "default_hello_timeout_secs")]
    pub hello_timeout_secs: u64,
}

/// TLS material for the edge router connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file holding the client certificate chain
    pub cert_file: PathBuf,
    /// PEM file holding the client private key
    pub key_file: PathBuf,
    /// PEM file holding the CA bundle that signs router certificates
    pub ca_file: PathBuf,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_send_queue_depth() -> usize {
    64
}

fn default_hello_timeout_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            tls: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            send_queue_depth: default_send_queue_depth(),
            hello_timeout_secs: default_hello_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)?;
        let mut config: Config = serde_json::from_str(&content)?;
        info!("Loaded configuration from {:?}", path.as_ref());
        config.apply_environment_overrides();
        Ok(config)
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_environment_overrides();
        config
    }

    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(value) = std::env::var("OVERLAY_CONNECT_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse::<u64>() {
                self.connect_timeout_secs = secs;
                info!("Connect timeout overridden by environment: {}s", secs);
            }
        }

        if let Ok(value) = std::env::var("OVERLAY_MAX_MESSAGE_SIZE") {
            if let Ok(size) = value.parse::<usize>() {
                self.channel.max_message_size = size;
                info!("Max message size overridden by environment: {}", size);
            }
        }

        if let Ok(value) = std::env::var("OVERLAY_HELLO_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse::<u64>() {
                self.channel.hello_timeout_secs = secs;
                info!("Hello timeout overridden by environment: {}s", secs);
            }
        }
    }
}

impl ChannelConfig {
    /// Hello deadline as a [`Duration`]
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_timeout_secs)
    }
}
