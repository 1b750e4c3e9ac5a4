//! Core configuration types and loading.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use super::links::LinkBlock;
use super::listen::BindConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identity.
    pub server: ServerConfig,
    /// Protocol tunables.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Listener blocks (`[[bind]]`).
    #[serde(default)]
    pub bind: Vec<BindConfig>,
    /// Link blocks (`[[link]]`).
    #[serde(default)]
    pub link: Vec<LinkBlock>,
    /// Trusted service servers that win every TS comparison.
    #[serde(default)]
    pub ulines: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Minimal configuration for a server with no links or listeners.
    pub fn for_server(name: &str, description: &str) -> Self {
        Self {
            server: ServerConfig {
                name: name.to_string(),
                description: description.to_string(),
                network: String::new(),
            },
            protocol: ProtocolConfig::default(),
            bind: Vec::new(),
            link: Vec::new(),
            ulines: Vec::new(),
        }
    }
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name (e.g., "hub.example.net").
    pub name: String,
    /// Description sent in SERVER introductions.
    #[serde(default)]
    pub description: String,
    /// Network name, informational.
    #[serde(default)]
    pub network: String,
}

/// Spanning-tree protocol tunables.
///
/// Defaults:
/// - `ping_interval`: 120 seconds between liveness pings
/// - `max_modes`: 20 mode parameters per FMODE line
/// - `line_budget`: 480 bytes per burst FJOIN, before the nick margin
/// - `skew_warn` / `skew_fatal`: 60 / 600 seconds of clock difference
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Module names announced in CAPAB. Both sides must agree.
    #[serde(default)]
    pub common_modules: Vec<String>,
    /// Seconds between pings to each direct peer.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Maximum parameters batched into one FMODE.
    #[serde(default = "default_max_modes")]
    pub max_modes: usize,
    /// Wire-line length budget for burst FJOIN lines.
    #[serde(default = "default_line_budget")]
    pub line_budget: usize,
    /// Longest nick, reserved as margin when filling FJOIN lines.
    #[serde(default = "default_nick_max")]
    pub nick_max: usize,
    /// Seconds before a pending outbound connect is abandoned.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Clock difference that earns an operator warning.
    #[serde(default = "default_skew_warn")]
    pub skew_warn: i64,
    /// Clock difference that aborts the link.
    #[serde(default = "default_skew_fatal")]
    pub skew_fatal: i64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            common_modules: Vec::new(),
            ping_interval: default_ping_interval(),
            max_modes: default_max_modes(),
            line_budget: default_line_budget(),
            nick_max: default_nick_max(),
            connect_timeout: default_connect_timeout(),
            skew_warn: default_skew_warn(),
            skew_fatal: default_skew_fatal(),
        }
    }
}

fn default_ping_interval() -> u64 {
    120
}

fn default_max_modes() -> usize {
    20
}

fn default_line_budget() -> usize {
    480
}

fn default_nick_max() -> usize {
    32
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_skew_warn() -> i64 {
    60
}

fn default_skew_fatal() -> i64 {
    600
}
