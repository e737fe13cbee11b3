//! Configuration module for the qotd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::corpus::Divider;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the quote server
#[derive(Parser, Debug, Clone)]
#[command(name = "qotd")]
#[command(author = "qotd authors")]
#[command(version = "0.1.0")]
#[command(about = "A quote of the day (RFC 865) server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to the quotes file
    #[arg(short, long)]
    pub quotes_file: Option<PathBuf>,

    /// Transport protocol to serve
    #[arg(short, long, value_enum)]
    pub transport: Option<Transport>,

    /// Internet protocol family to bind
    #[arg(short = 'i', long, value_enum)]
    pub family: Option<Family>,

    /// How the quotes file is split into quotes
    #[arg(short, long, value_enum)]
    pub divider: Option<Divider>,

    /// Surround each quote with blank lines
    #[arg(long, overrides_with = "no_pad")]
    pub pad: bool,

    /// Send the quote without padding
    #[arg(long)]
    pub no_pad: bool,

    /// Serve the same quote for the whole day
    #[arg(long, overrides_with = "no_daily")]
    pub daily: bool,

    /// Pick a new quote for every request
    #[arg(long)]
    pub no_daily: bool,

    /// Allow quotes larger than 512 bytes
    #[arg(long)]
    pub allow_big: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Default for CliArgs {
    /// Matches parsing an empty command line.
    fn default() -> Self {
        CliArgs {
            config: None,
            port: None,
            quotes_file: None,
            transport: None,
            family: None,
            divider: None,
            pad: false,
            no_pad: false,
            daily: false,
            no_daily: false,
            allow_big: false,
            log_level: default_log_level(),
        }
    }
}

/// Transport protocol(s) the server answers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Both,
}

impl Transport {
    pub fn tcp(self) -> bool {
        matches!(self, Transport::Tcp | Transport::Both)
    }

    pub fn udp(self) -> bool {
        matches!(self, Transport::Udp | Transport::Both)
    }
}

/// Address family of the bound sockets.
///
/// `Both` binds a single IPv6 socket that also accepts IPv4-mapped peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ipv4,
    Ipv6,
    Both,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub quotes: QuotesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default = "default_family")]
    pub family: Family,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            transport: default_transport(),
            family: default_family(),
        }
    }
}

/// Quote corpus configuration
#[derive(Debug, Deserialize)]
pub struct QuotesConfig {
    #[serde(default = "default_quotes_file")]
    pub file: PathBuf,
    #[serde(default = "default_divider")]
    pub divider: Divider,
    #[serde(default = "default_true")]
    pub pad: bool,
    #[serde(default = "default_true")]
    pub daily: bool,
    #[serde(default)]
    pub allow_big: bool,
}

impl Default for QuotesConfig {
    fn default() -> Self {
        Self {
            file: default_quotes_file(),
            divider: default_divider(),
            pad: true,
            daily: true,
            allow_big: false,
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

fn default_port() -> u16 {
    17
}

fn default_transport() -> Transport {
    Transport::Tcp
}

fn default_family() -> Family {
    Family::Both
}

fn default_quotes_file() -> PathBuf {
    PathBuf::from("/usr/share/qotd/quotes.txt")
}

fn default_divider() -> Divider {
    Divider::Percent
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The socket parameters that require a re-bind when they change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub transport: Transport,
    pub family: Family,
    pub port: u16,
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub transport: Transport,
    pub family: Family,
    pub quotes_file: PathBuf,
    pub divider: Divider,
    pub pad: bool,
    pub daily: bool,
    pub allow_big: bool,
    pub log_level: String,
}

impl Config {
    /// Parse the process arguments and resolve them against the config file.
    pub fn load() -> Result<(CliArgs, Self), ConfigError> {
        let cli = CliArgs::parse();
        let config = Self::resolve(&cli)?;
        Ok((cli, config))
    }

    /// Resolve CLI args and the optional TOML file into a configuration.
    ///
    /// CLI arguments take precedence over TOML file values. Called again on
    /// reload so edits to the file are picked up.
    pub fn resolve(cli: &CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: &CliArgs, toml_config: TomlConfig) -> Self {
        let quotes = toml_config.quotes;

        Config {
            port: cli.port.unwrap_or(toml_config.server.port),
            transport: cli.transport.unwrap_or(toml_config.server.transport),
            family: cli.family.unwrap_or(toml_config.server.family),
            quotes_file: cli.quotes_file.clone().unwrap_or(quotes.file),
            divider: cli.divider.unwrap_or(quotes.divider),
            pad: flag(cli.pad, cli.no_pad, quotes.pad),
            daily: flag(cli.daily, cli.no_daily, quotes.daily),
            allow_big: cli.allow_big || quotes.allow_big,
            log_level: if cli.log_level != default_log_level() {
                cli.log_level.clone()
            } else {
                toml_config.logging.level
            },
        }
    }

    pub fn connection(&self) -> Connection {
        Connection {
            transport: self.transport,
            family: self.family,
            port: self.port,
        }
    }
}

fn flag(on: bool, off: bool, fallback: bool) -> bool {
    match (on, off) {
        (true, _) => true,
        (false, true) => false,
        (false, false) => fallback,
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::resolve(&CliArgs::default()).unwrap();
        assert_eq!(config.port, 17);
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.family, Family::Both);
        assert_eq!(config.divider, Divider::Percent);
        assert_eq!(config.quotes_file, PathBuf::from("/usr/share/qotd/quotes.txt"));
        assert!(config.pad);
        assert!(config.daily);
        assert!(!config.allow_big);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_default_args_match_empty_command_line() {
        let parsed = CliArgs::parse_from(["qotd"]);
        let defaulted = CliArgs::default();
        assert_eq!(parsed.log_level, defaulted.log_level);
        assert_eq!(
            Config::resolve(&parsed).unwrap(),
            Config::resolve(&defaulted).unwrap()
        );
    }

    #[test]
    fn test_log_level_from_file_unless_given() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();

        let cli = CliArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(Config::resolve(&cli).unwrap().log_level, "debug");

        let cli = CliArgs {
            log_level: "trace".to_string(),
            ..cli
        };
        assert_eq!(Config::resolve(&cli).unwrap().log_level, "trace");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            port = 1717
            transport = "both"
            family = "ipv4"

            [quotes]
            file = "/tmp/quotes.txt"
            divider = "line"
            pad = false
            daily = false
            allow_big = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 1717);
        assert_eq!(config.server.transport, Transport::Both);
        assert_eq!(config.server.family, Family::Ipv4);
        assert_eq!(config.quotes.file, PathBuf::from("/tmp/quotes.txt"));
        assert_eq!(config.quotes.divider, Divider::Line);
        assert!(!config.quotes.pad);
        assert!(!config.quotes.daily);
        assert!(config.quotes.allow_big);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 1717\n[quotes]\npad = true\ndivider = \"file\"").unwrap();

        let cli = CliArgs {
            config: Some(file.path().to_path_buf()),
            port: Some(2000),
            no_pad: true,
            log_level: "info".to_string(),
            ..Default::default()
        };

        let config = Config::resolve(&cli).unwrap();
        assert_eq!(config.port, 2000);
        assert!(!config.pad);
        assert_eq!(config.divider, Divider::File);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/qotd.toml")),
            ..Default::default()
        };

        assert!(matches!(
            Config::resolve(&cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }

    #[test]
    fn test_invalid_enum_in_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ntransport = \"sctp\"").unwrap();

        let cli = CliArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        assert!(matches!(
            Config::resolve(&cli),
            Err(ConfigError::TomlParse(_, _))
        ));
    }

    #[test]
    fn test_connection_equality() {
        let config = Config::resolve(&CliArgs::default()).unwrap();
        let mut other = config.clone();
        other.pad = false;
        assert_eq!(config.connection(), other.connection());

        other.port = 1017;
        assert_ne!(config.connection(), other.connection());
    }
}
