//! Configuration module for the line-relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Which event dispatcher drives the connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// One blocking worker thread per connection.
    Threaded,
    /// Single-threaded readiness multiplexing (epoll/kqueue via mio).
    Mio,
    /// One tokio task per connection.
    Tokio,
}

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(author = "line-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented text broadcast relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7777)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Event dispatcher to use
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Maximum number of concurrently connected clients
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Maximum length of a single line in bytes
    #[arg(long)]
    pub max_line_length: Option<usize>,

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
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Event dispatcher
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Events drained per poll (mio dispatcher)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: default_runtime(),
            backlog: default_backlog(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Per-connection resource limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Size of the scratch buffer used for each read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Pending outbound bytes allowed per peer before it is evicted (mio)
    #[serde(default = "default_max_backlog_bytes")]
    pub max_backlog_bytes: usize,
    /// Queued outbound lines allowed per peer before it is evicted (tokio)
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            read_buffer_size: default_read_buffer_size(),
            max_line_length: default_max_line_length(),
            max_backlog_bytes: default_max_backlog_bytes(),
            outbound_queue: default_outbound_queue(),
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
    "127.0.0.1:7777".to_string()
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Mio
}

fn default_backlog() -> i32 {
    1024
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_max_line_length() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_backlog_bytes() -> usize {
    256 * 1024 // 256 KB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub runtime: RuntimeType,
    pub backlog: i32,
    pub event_capacity: usize,
    pub max_connections: usize,
    pub read_buffer_size: usize,
    pub max_line_length: usize,
    pub max_backlog_bytes: usize,
    pub outbound_queue: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7777)),
            runtime: toml_config.server.runtime,
            backlog: toml_config.server.backlog,
            event_capacity: toml_config.server.event_capacity,
            max_connections: toml_config.limits.max_connections,
            read_buffer_size: toml_config.limits.read_buffer_size,
            max_line_length: toml_config.limits.max_line_length,
            max_backlog_bytes: toml_config.limits.max_backlog_bytes,
            outbound_queue: toml_config.limits.outbound_queue,
            log_level: toml_config.logging.level,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listen address '{listen}'")))?;

        let config = Config {
            listen,
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            backlog: toml_config.server.backlog,
            event_capacity: toml_config.server.event_capacity,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.limits.max_connections),
            read_buffer_size: toml_config.limits.read_buffer_size,
            max_line_length: cli
                .max_line_length
                .unwrap_or(toml_config.limits.max_line_length),
            max_backlog_bytes: toml_config.limits.max_backlog_bytes,
            outbound_queue: toml_config.limits.outbound_queue,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("max_connections", self.max_connections),
            ("read_buffer_size", self.read_buffer_size),
            ("max_line_length", self.max_line_length),
            ("max_backlog_bytes", self.max_backlog_bytes),
            ("outbound_queue", self.outbound_queue),
            ("event_capacity", self.event_capacity),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(what) => write!(f, "Invalid configuration: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}
