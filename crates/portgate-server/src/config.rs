//! Server configuration
//!
//! Read from a JSON file (or assembled by an embedding CLI) and handed to
//! [`crate::server::Server`]. Port sets use range expressions: a list of
//! `"100"` / `"100-200"` strings; the dynamic-allocation set is
//! `used_ports − excluded_ports`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port range {0:?}")]
    InvalidPortRange(String),

    #[error("no ports remain after applying excluded_ports")]
    NoAllowedPorts,

    #[error("client authentication must be enabled: set auth, auth_file or auth_table")]
    NoAuth,

    #[error("data directory cannot be empty")]
    NoDataDir,

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where client credentials come from. Exactly one must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Inline `id:password` pair
    #[serde(default)]
    pub auth: Option<String>,
    /// Path to a JSON file mapping id to password
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
    /// Whether the file source accepts writes through the API
    #[serde(default)]
    pub auth_write: bool,
    /// SQLite table name inside `<data_dir>/auth.db`
    #[serde(default)]
    pub auth_table: Option<String>,
}

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the client listener binds, e.g. `0.0.0.0:8080`
    pub listen_address: String,
    /// Address handed to the external HTTP API collaborator
    #[serde(default)]
    pub api_address: Option<String>,
    /// Seed for the long-term server key; empty means generate-and-persist
    #[serde(default)]
    pub key_seed: String,
    pub data_dir: PathBuf,

    /// Port range expressions clients may be reached through
    #[serde(default = "default_used_ports")]
    pub used_ports: Vec<String>,
    #[serde(default)]
    pub excluded_ports: Vec<String>,

    #[serde(flatten)]
    pub auth: AuthConfig,

    /// How long disconnected clients stay known, in seconds; 0 disables
    #[serde(default)]
    pub keep_lost_clients_secs: u64,
    #[serde(default = "default_cleanup_clients_secs")]
    pub cleanup_clients_interval_secs: u64,
    #[serde(default = "default_check_port_timeout_secs")]
    pub check_port_timeout_secs: u64,
    #[serde(default = "default_run_remote_cmd_timeout_secs")]
    pub run_remote_cmd_timeout_secs: i64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Ban duration for client-connection abuse, in seconds
    #[serde(default = "default_ban_time_secs")]
    pub client_ban_time_secs: u64,
}

fn default_used_ports() -> Vec<String> {
    vec!["20000-30000".to_string()]
}

fn default_cleanup_clients_secs() -> u64 {
    60 * 3
}

fn default_check_port_timeout_secs() -> u64 {
    2
}

fn default_run_remote_cmd_timeout_secs() -> i64 {
    60
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_ban_time_secs() -> u64 {
    60 * 60
}

impl ServerConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::NoDataDir);
        }
        if self.auth.auth.is_none() && self.auth.auth_file.is_none() && self.auth.auth_table.is_none()
        {
            return Err(ConfigError::NoAuth);
        }
        self.allowed_ports().map(|_| ())
    }

    /// The static set dynamic tunnel ports are allocated from
    pub fn allowed_ports(&self) -> Result<BTreeSet<u16>, ConfigError> {
        let used = parse_port_expressions(&self.used_ports)?;
        let excluded = parse_port_expressions(&self.excluded_ports)?;
        let allowed: BTreeSet<u16> = used.difference(&excluded).copied().collect();
        if allowed.is_empty() {
            return Err(ConfigError::NoAllowedPorts);
        }
        Ok(allowed)
    }

    pub fn keep_lost_clients(&self) -> Option<chrono::Duration> {
        if self.keep_lost_clients_secs == 0 {
            None
        } else {
            Some(chrono::Duration::seconds(self.keep_lost_clients_secs as i64))
        }
    }

    pub fn cleanup_clients_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_clients_interval_secs)
    }

    pub fn check_port_timeout(&self) -> Duration {
        Duration::from_secs(self.check_port_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn client_ban_time(&self) -> Duration {
        Duration::from_secs(self.client_ban_time_secs)
    }
}

/// Parse `"100"` / `"100-200"` expressions into a port set
pub fn parse_port_expressions(expressions: &[String]) -> Result<BTreeSet<u16>, ConfigError> {
    let mut ports = BTreeSet::new();
    for expr in expressions {
        let expr = expr.trim();
        if let Some((start, end)) = expr.split_once('-') {
            let start: u16 = start
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPortRange(expr.to_string()))?;
            let end: u16 = end
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPortRange(expr.to_string()))?;
            if start > end {
                return Err(ConfigError::InvalidPortRange(expr.to_string()));
            }
            ports.extend(start..=end);
        } else {
            let port: u16 = expr
                .parse()
                .map_err(|_| ConfigError::InvalidPortRange(expr.to_string()))?;
            ports.insert(port);
        }
    }
    Ok(ports)
}
