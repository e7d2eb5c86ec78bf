//! Configuration module for the eofd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::{Protocol, ReplyPolicy, SentinelScope};
use crate::runtime::ConnectionSettings;
use crate::server::ServerOptions;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "eofd")]
#[command(version)]
#[command(about = "A sentinel-delimited TCP request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (IPv4 or IPv6 literal)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Receive buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Idle connection ceiling in seconds
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Reply policy
    #[arg(long, value_enum)]
    pub policy: Option<PolicyKind>,

    /// Reply text for the `static` policy
    #[arg(long)]
    pub reply: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Reply policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// `ack.` per chunk, `bye.` on the sentinel
    #[default]
    Fixed,
    /// Reply the configured text to every chunk
    Static,
    /// Echo every chunk back
    Echo,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_wait_ms")]
    pub accept_wait_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            workers: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            accept_wait_ms: default_wait_ms(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_wait_ms")]
    pub supervisor_tick_ms: u64,
    #[serde(default = "default_wait_ms")]
    pub receive_wait_ms: u64,
    #[serde(default = "default_wait_ms")]
    pub send_wait_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            supervisor_tick_ms: default_wait_ms(),
            receive_wait_ms: default_wait_ms(),
            send_wait_ms: default_wait_ms(),
        }
    }
}

/// Reply protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolSection {
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default = "default_reply")]
    pub reply: String,
    #[serde(default)]
    pub sentinel_scope: SentinelScope,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            reply: default_reply(),
            sentinel_scope: SentinelScope::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_backlog() -> u32 {
    100
}

fn default_max_connections() -> usize {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_wait_ms() -> u64 {
    1_000
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_reply() -> String {
    "ack".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub shutdown_grace: Duration,
    pub accept_wait: Duration,
    pub connection: ConnectionSettings,
    pub policy: PolicyKind,
    pub reply: String,
    pub sentinel_scope: SentinelScope,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI args.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml: TomlConfig) -> Result<Self, ConfigError> {
        let conn = toml.connection;
        let connection = ConnectionSettings {
            buffer_size: cli.buffer_size.unwrap_or(conn.buffer_size),
            idle_timeout: Duration::from_secs(cli.idle_timeout.unwrap_or(conn.idle_timeout_secs)),
            supervisor_tick: Duration::from_millis(conn.supervisor_tick_ms),
            receive_wait: Duration::from_millis(conn.receive_wait_ms),
            send_wait: Duration::from_millis(conn.send_wait_ms),
        };

        let config = Config {
            host: cli.host.unwrap_or(toml.server.host),
            port: cli.port.unwrap_or(toml.server.port),
            backlog: cli.backlog.unwrap_or(toml.server.backlog),
            max_connections: cli.max_connections.unwrap_or(toml.server.max_connections),
            workers: cli.workers.or(toml.server.workers),
            shutdown_grace: Duration::from_millis(toml.server.shutdown_grace_ms),
            accept_wait: Duration::from_millis(toml.server.accept_wait_ms),
            connection,
            policy: cli.policy.unwrap_or(toml.protocol.policy),
            reply: cli.reply.unwrap_or(toml.protocol.reply),
            sentinel_scope: toml.protocol.sentinel_scope,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zero_wait = [
            ("connection.supervisor_tick_ms", self.connection.supervisor_tick),
            ("connection.receive_wait_ms", self.connection.receive_wait),
            ("connection.send_wait_ms", self.connection.send_wait),
            ("server.accept_wait_ms", self.accept_wait),
        ]
        .into_iter()
        .find(|(_, d)| d.is_zero());

        if let Some((key, _)) = zero_wait {
            return Err(ConfigError::Invalid(key, "must be greater than zero".into()));
        }
        if self.connection.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "connection.buffer_size",
                "must be greater than zero".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections",
                "must be greater than zero".into(),
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "server.workers",
                "must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Listener options for [`crate::server::Server`].
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            backlog: self.backlog,
            max_connections: self.max_connections,
            accept_wait: self.accept_wait,
            shutdown_grace: self.shutdown_grace,
            connection: self.connection,
        }
    }

    /// Build the reply protocol this configuration selects.
    pub fn protocol(&self) -> Protocol {
        let policy = match self.policy {
            PolicyKind::Fixed => ReplyPolicy::Fixed,
            PolicyKind::Static => {
                let reply = self.reply.clone();
                ReplyPolicy::pluggable(move |_: &str| reply.clone())
            }
            PolicyKind::Echo => ReplyPolicy::pluggable(|received: &str| received.to_string()),
        };
        Protocol::new(policy, self.sentinel_scope)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, String),
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
            ConfigError::Invalid(key, reason) => write!(f, "Invalid value for '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
