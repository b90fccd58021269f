//! Configuration for the echoplex binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::sockopt::SocketPolicy;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echoplex")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP echo server", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the echo server
    Serve(ServeArgs),
    /// Perform a single echo round-trip against a running server
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g. 127.0.0.1:9999; port 0 for ephemeral)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// listen(2) backlog (accept queue size)
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Poll timeout in milliseconds (0 polls and returns immediately;
    /// omitted everywhere means wait() blocks until a socket is ready)
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "debug")]
    pub log_level: String,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            config: None,
            listen: None,
            backlog: None,
            poll_timeout_ms: None,
            log_level: "debug".to_string(),
        }
    }
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    pub addr: String,

    /// Message to send
    #[arg(short, long, default_value = "hello")]
    pub message: String,

    /// Connect timeout in milliseconds
    #[arg(long, default_value_t = 3500)]
    pub connect_timeout_ms: u64,

    /// Recv/send timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub io_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "debug")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Socket options; omitting the whole table selects the demo policy,
    /// an empty table leaves every option at the platform default.
    pub socket: Option<SocketPolicy>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Accept queue size for listen(2)
    pub backlog: Option<i32>,
    /// Poll timeout in milliseconds; absent means block indefinitely
    pub poll_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: None,
            poll_timeout_ms: None,
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
    "127.0.0.1:9999".to_string()
}

fn default_log_level() -> String {
    "debug".to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: Option<i32>,
    pub poll_timeout: Option<Duration>,
    pub policy: SocketPolicy,
    pub log_level: String,
}

impl Config {
    /// Resolve the serve configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(args: ServeArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = args.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let poll_timeout = args
            .poll_timeout_ms
            .or(toml_config.server.poll_timeout_ms)
            .map(Duration::from_millis);

        Ok(Config {
            listen: args.listen.unwrap_or(toml_config.server.listen),
            backlog: args.backlog.or(toml_config.server.backlog),
            poll_timeout,
            policy: toml_config.socket.unwrap_or_else(SocketPolicy::demo),
            log_level: if args.log_level != "debug" {
                args.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
