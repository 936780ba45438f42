//! Configuration module for the advlock server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the lock server
#[derive(Parser, Debug, Default)]
#[command(name = "advlock")]
#[command(version)]
#[command(about = "A network advisory lock server", long_about = None)]
pub struct CliArgs {
    /// Address to bind to (e.g., 127.0.0.1)
    pub address: Option<String>,

    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Pending connection backlog for the listening socket
    #[arg(short, long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_address")]
    pub address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Bytes read from a socket per read call
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Longest unterminated line a client may send before being dropped
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Readiness events handled per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Queued reply bytes at which a connection stops reading and parsing
    /// until the client catches up
    #[serde(default = "default_output_high_water")]
    pub output_high_water: usize,
    /// Queued reply bytes beyond which a connection is dropped
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            backlog: default_backlog(),
            read_chunk: default_read_chunk(),
            max_line_length: default_max_line_length(),
            event_capacity: default_event_capacity(),
            output_high_water: default_output_high_water(),
            max_pending_output: default_max_pending_output(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    49915
}

fn default_backlog() -> i32 {
    128
}

fn default_read_chunk() -> usize {
    4096
}

fn default_max_line_length() -> usize {
    64 * 1024
}

fn default_event_capacity() -> usize {
    1024
}

fn default_output_high_water() -> usize {
    64 * 1024
}

fn default_max_pending_output() -> usize {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub backlog: i32,
    pub read_chunk: usize,
    pub max_line_length: usize,
    pub event_capacity: usize,
    pub output_high_water: usize,
    pub max_pending_output: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        Self::merge(CliArgs::default(), toml_config)
    }
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against the TOML file they name.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            address: cli.address.unwrap_or(toml_config.server.address),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            read_chunk: toml_config.server.read_chunk,
            max_line_length: toml_config.server.max_line_length,
            event_capacity: toml_config.server.event_capacity,
            output_high_water: toml_config.server.output_high_water,
            max_pending_output: toml_config.server.max_pending_output,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        }
    }

    /// Socket address the listener binds to.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),
}
