// Coordinator and backend configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration for the transaction manager and its recovery checker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Directory holding the recovery log file
    pub log_directory: PathBuf,

    /// How often the recovery checker runs, in milliseconds
    pub tick_interval_ms: u64,

    /// Pool bound for backends that do not set their own
    pub max_connections_per_backend: usize,

    /// How long a checkout waits for a free connection, in milliseconds
    pub checkout_timeout_ms: u64,

    /// Leading component of every generated xid
    pub xid_prefix: String,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            log_directory: PathBuf::from("data"),
            tick_interval_ms: 5_000,
            max_connections_per_backend: 64,
            checkout_timeout_ms: 10_000,
            xid_prefix: "XID".to_string(),
        }
    }
}

impl TxnConfig {
    /// Load a config from a JSON file; absent fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Format {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

/// Role a backend plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    /// A shard holding partitioned data
    #[default]
    Normal,
    /// An existing database attached as-is
    Attached,
}

/// Connection settings for one backend shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Zero means "use the coordinator default"
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub role: BackendRole,
}

fn default_charset() -> String {
    "utf8".to_string()
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: String::new(),
            password: String::new(),
            database: String::new(),
            charset: default_charset(),
            max_connections: 0,
            role: BackendRole::Normal,
        }
    }

    pub fn with_role(mut self, role: BackendRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Effective pool bound given the coordinator default
    pub fn pool_size(&self, default: usize) -> usize {
        if self.max_connections > 0 {
            self.max_connections
        } else {
            default.max(1)
        }
    }
}
