use config::ConfigError as ConfigLibError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::proxy::session::SessionOptions;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Config library error: {0}")]
    ConfigLibError(#[from] ConfigLibError),
    #[error("Failed to render config: {0}")]
    RenderError(#[from] toml::ser::Error),
}

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Local port the HTTP side listens on (always bound to 127.0.0.1)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// SOCKS5 upstream host
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    /// SOCKS5 upstream port
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
    /// Relay buffer size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Upstream connect timeout in seconds, 0 disables it
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Timeout in seconds for everything before the tunnel is up, 0 disables it
    #[serde(default)]
    pub handshake_timeout: u64,
    /// Log configuration
    #[serde(default)]
    pub log: LoggerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggerConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path, empty for console only
    #[serde(default = "default_log_path")]
    pub path: String,
    /// Log file archive pattern
    #[serde(default = "default_archive_pattern")]
    pub archive_pattern: String,
    /// Number of log files to keep
    #[serde(default = "default_file_count")]
    pub file_count: u32,
    /// Size of each log file (MB)
    #[serde(default = "default_file_size")]
    pub file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            upstream_host: default_upstream_host(),
            upstream_port: default_upstream_port(),
            buffer_size: default_buffer_size(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: 0,
            log: LoggerConfig::default(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: default_log_path(),
            archive_pattern: default_archive_pattern(),
            file_count: default_file_count(),
            file_size: default_file_size(),
        }
    }
}

fn default_listen_port() -> u16 {
    8118
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    1080
}

fn default_buffer_size() -> usize {
    4096
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "Info".to_string()
}

fn default_log_path() -> String {
    "logs/http-socks-gateway.log".to_string()
}

fn default_archive_pattern() -> String {
    "logs/archive/http-socks-gateway-{}.log".to_string()
}

fn default_file_count() -> u32 {
    5
}

/// Default file size in MB
fn default_file_size() -> u64 {
    10
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl Config {
    /// Load configuration from file. A missing file yields the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .build()
            .map_err(ConfigError::ConfigLibError)?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Upstream host cannot be empty".to_string(),
            ));
        }

        if self.upstream_port == 0 {
            return Err(ConfigError::InvalidConfig(
                "Upstream port cannot be 0".to_string(),
            ));
        }

        if self.buffer_size == 0 || self.buffer_size > 65536 {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid buffer size: {}. Must be between 1 and 65536",
                self.buffer_size
            )));
        }

        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            buffer_size: self.buffer_size,
            connect_timeout: seconds(self.connect_timeout),
            handshake_timeout: seconds(self.handshake_timeout),
        }
    }

    /// Effective configuration rendered back to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
