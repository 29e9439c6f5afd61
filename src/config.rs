//! Configuration for the netpump server binary.
//!
//! Supports both command-line arguments and a TOML configuration
//! file. CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "netpump")]
#[command(about = "Reactive TCP echo/session server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:3001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of reactor loops (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub loops: Option<usize>,

    /// Session idle timeout in milliseconds
    #[arg(long)]
    pub expire_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of reactor loops (0 = number of cores)
    #[serde(default)]
    pub loops: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            loops: 0,
            backlog: default_backlog(),
        }
    }
}

/// Session registry configuration.
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Idle timeout in milliseconds
    #[serde(default = "default_expire_ms")]
    pub expire_ms: u64,
    /// Timing wheel tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expire_ms: default_expire_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

/// Per-connection socket options.
#[derive(Debug, Deserialize, Default)]
pub struct SocketConfig {
    #[serde(default)]
    pub keepalive: bool,
    pub send_buffer: Option<usize>,
    pub recv_buffer: Option<usize>,
}

/// Logging configuration.
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
    "127.0.0.1:3001".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_expire_ms() -> u64 {
    30_000
}

fn default_tick_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub loops: usize,
    pub backlog: i32,
    pub expire_ms: u64,
    pub tick_ms: u64,
    pub keepalive: bool,
    pub send_buffer: Option<usize>,
    pub recv_buffer: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(listen_str.clone()))?;

        Ok(Config {
            listen,
            loops: cli.loops.unwrap_or(toml_config.server.loops),
            backlog: toml_config.server.backlog,
            expire_ms: cli.expire_ms.unwrap_or(toml_config.session.expire_ms),
            tick_ms: toml_config.session.tick_ms,
            keepalive: toml_config.socket.keepalive,
            send_buffer: toml_config.socket.send_buffer,
            recv_buffer: toml_config.socket.recv_buffer,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String),
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
            ConfigError::InvalidAddress(addr) => {
                write!(f, "Invalid listen address '{addr}': expected ip:port")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:3001");
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.session.expire_ms, 30_000);
        assert_eq!(config.session.tick_ms, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:4000"
            loops = 4
            backlog = 256

            [session]
            expire_ms = 5000
            tick_ms = 50

            [socket]
            keepalive = true
            send_buffer = 65536

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:4000");
        assert_eq!(config.server.loops, 4);
        assert_eq!(config.server.backlog, 256);
        assert_eq!(config.session.expire_ms, 5000);
        assert_eq!(config.session.tick_ms, 50);
        assert!(config.socket.keepalive);
        assert_eq!(config.socket.send_buffer, Some(65536));
        assert_eq!(config.socket.recv_buffer, None);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml_defaults() {
        let cli = CliArgs {
            config: None,
            listen: Some("127.0.0.1:9999".into()),
            loops: Some(2),
            expire_ms: Some(1234),
            log_level: "trace".into(),
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.listen.port(), 9999);
        assert_eq!(config.loops, 2);
        assert_eq!(config.expire_ms, 1234);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_invalid_listen_address() {
        let cli = CliArgs {
            config: None,
            listen: Some("not-an-address".into()),
            loops: None,
            expire_ms: None,
            log_level: "info".into(),
        };
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::InvalidAddress(_))
        ));
    }
}
