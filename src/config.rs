//! Configuration
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`--config path`)
//! 3. command-line flags
//!
//! ```toml
//! [server]
//! address = "0.0.0.0:6379"
//! max_connections = 1000   # 0 = unlimited
//! idle_timeout = 300       # seconds, 0 = disabled
//! drain_timeout = 10       # seconds
//! handler = "resp"         # or "echo"
//!
//! [logging]
//! level = "info"
//! dir = "logs"             # also write logs to logs/respgate-<date>.log
//! ```

use crate::connection::DEFAULT_DRAIN_TIMEOUT;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "respgate")]
#[command(version)]
#[command(about = "TCP front-end for a RESP key-value server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:6379)
    #[arg(short = 'l', long)]
    pub address: Option<String>,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(short = 'm', long)]
    pub max_connections: Option<u32>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long, value_name = "SECONDS")]
    pub idle_timeout: Option<u64>,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, value_name = "SECONDS")]
    pub drain_timeout: Option<u64>,

    /// Connection handler
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for log files, in addition to stdout
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

/// Which handler serves connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Echo every line back (transport testing)
    Echo,
    /// Decode RESP units and reply to each
    #[default]
    Resp,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub server: ServerSection,
    pub logging: LoggingSection,
}

/// `[server]` section
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub address: String,
    pub max_connections: u32,
    pub idle_timeout: u64,
    pub drain_timeout: u64,
    pub handler: HandlerKind,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            max_connections: 0,
            idle_timeout: 0,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT.as_secs(),
            handler: HandlerKind::default(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub name: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            name: "respgate".to_string(),
        }
    }
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `<host>:<port>` to listen on
    pub address: String,
    /// Maximum concurrent connections, 0 = unlimited
    pub max_connections: u32,
    /// Idle connection timeout, zero = disabled
    pub idle_timeout: Duration,
    /// Per-connection drain bound during shutdown
    pub drain_timeout: Duration,
    pub handler: HandlerKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerSection::default().into()
    }
}

impl From<ServerSection> for ServerConfig {
    fn from(section: ServerSection) -> Self {
        Self {
            address: section.address,
            max_connections: section.max_connections,
            idle_timeout: Duration::from_secs(section.idle_timeout),
            drain_timeout: Duration::from_secs(section.drain_timeout),
            handler: section.handler,
        }
    }
}

impl ServerConfig {
    /// Checks that the address has a host part and a numeric port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("address '{}' has no port", self.address)))?;

        if host.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "address '{}' has no host",
                self.address
            )));
        }
        port.parse::<u16>().map_err(|_| {
            ConfigError::Invalid(format!("address '{}' has an invalid port", self.address))
        })?;
        Ok(())
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub name: String,
}

impl From<LoggingSection> for LoggingConfig {
    fn from(section: LoggingSection) -> Self {
        Self {
            level: section.level,
            dir: section.dir,
            name: section.name,
        }
    }
}

impl LoggingConfig {
    /// Log file for `date`, if file logging is enabled.
    pub fn file_path(&self, date: NaiveDate) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.log", self.name, date.format("%Y-%m-%d"))))
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    }
                })?;
                Self::parse_toml(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        Self::merge(cli, toml_config)
    }

    pub fn parse_toml(contents: &str) -> Result<TomlConfig, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Overlays CLI flags on file values and validates the result.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let mut server = ServerConfig::from(file.server);
        if let Some(address) = cli.address {
            server.address = address;
        }
        if let Some(max) = cli.max_connections {
            server.max_connections = max;
        }
        if let Some(secs) = cli.idle_timeout {
            server.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.drain_timeout {
            server.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(handler) = cli.handler {
            server.handler = handler;
        }
        server.validate()?;

        let mut logging = LoggingConfig::from(file.logging);
        if let Some(level) = cli.log_level {
            logging.level = level;
        }
        if cli.log_dir.is_some() {
            logging.dir = cli.log_dir;
        }

        Ok(Config { server, logging })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
