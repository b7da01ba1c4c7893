//! Configuration module for the asyncer server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::SessionConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "asyncer")]
#[command(version = "0.1.0")]
#[command(about = "A TCP session server with pluggable packet handlers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:17777)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Receive buffer size per session in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Interval of the connectivity check while a read is pending, in milliseconds
    #[arg(long)]
    pub liveness_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Session-related configuration
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    /// Receive buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Liveness check interval in milliseconds
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:17777".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

fn default_liveness_timeout_ms() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub buffer_size: usize,
    pub liveness_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point to, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(listen, e))?;

        let buffer_size = cli.buffer_size.unwrap_or(toml_config.session.buffer_size);
        if buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }

        Ok(Config {
            listen,
            buffer_size,
            liveness_timeout: Duration::from_millis(
                cli.liveness_timeout_ms
                    .unwrap_or(toml_config.session.liveness_timeout_ms),
            ),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Settings applied to every accepted session.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            buffer_size: self.buffer_size,
            liveness_timeout: self.liveness_timeout,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen address '{0}': {1}")]
    InvalidListen(String, #[source] std::net::AddrParseError),

    #[error("Buffer size must be greater than zero")]
    ZeroBufferSize,
}
