// Backend registry: one connection pool per shard, keyed by backend name

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::connection::Connector;
use crate::backend::error::{BackendError, Result};
use crate::backend::pool::{ConnectionPool, PoolStats};
use crate::common::persist::write_json_atomic;
use crate::common::types::ResultSet;
use crate::config::{BackendConfig, TxnConfig};

/// File name of the persisted topology inside the meta directory
pub const BACKEND_CONFIG_FILE: &str = "backend.json";

/// On-disk shape of the persisted topology
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BackendsFile {
    pub backends: Vec<BackendConfig>,
}

impl BackendsFile {
    /// Read a topology file; a missing file is an empty topology
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(BackendError::ConfigIo {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_slice(&data).map_err(|source| BackendError::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A registered backend and its pool
pub struct Backend {
    config: BackendConfig,
    pool: ConnectionPool,
}

impl Backend {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Registry of every backend the coordinator can reach
pub struct BackendRegistry {
    connector: Arc<dyn Connector>,
    backends: RwLock<HashMap<String, Arc<Backend>>>,
    default_max_connections: usize,
    checkout_timeout: Duration,
    config_file: Option<PathBuf>,
}

impl BackendRegistry {
    /// Create an empty registry with no persisted topology
    pub fn new(connector: Arc<dyn Connector>, config: &TxnConfig) -> Self {
        Self {
            connector,
            backends: RwLock::new(HashMap::new()),
            default_max_connections: config.max_connections_per_backend,
            checkout_timeout: config.checkout_timeout(),
            config_file: None,
        }
    }

    /// Create an empty registry that persists its topology to `path`
    pub fn with_config_file(
        connector: Arc<dyn Connector>,
        config: &TxnConfig,
        path: impl Into<PathBuf>,
    ) -> Self {
        let mut registry = Self::new(connector, config);
        registry.config_file = Some(path.into());
        registry
    }

    /// Rebuild the registry from the topology persisted at `path`
    pub fn load(connector: Arc<dyn Connector>, config: &TxnConfig, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = BackendsFile::load(&path)?;
        let registry = Self::with_config_file(connector, config, path);
        for backend in file.backends {
            registry.add(backend)?;
        }
        Ok(registry)
    }

    /// Register a backend. Its pool dials lazily on first checkout.
    pub fn add(&self, config: BackendConfig) -> Result<()> {
        let mut backends = self.backends.write();
        if backends.contains_key(&config.name) {
            return Err(BackendError::DuplicateBackend(config.name));
        }

        let pool = ConnectionPool::new(
            config.clone(),
            config.pool_size(self.default_max_connections),
            self.checkout_timeout,
            self.connector.clone(),
        );
        info!("Adding backend {} at {} ({:?})", config.name, config.address, config.role);
        backends.insert(config.name.clone(), Arc::new(Backend { config, pool }));
        Ok(())
    }

    /// Unregister a backend and close its pool
    pub fn remove(&self, name: &str) -> Result<()> {
        let backend = self
            .backends
            .write()
            .remove(name)
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))?;
        info!("Removing backend {}", name);
        backend.pool.close();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Backend>> {
        self.backends
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.read().contains_key(name)
    }

    /// Names of every registered backend, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Configs of every registered backend, sorted by name
    pub fn configs(&self) -> Vec<BackendConfig> {
        let mut configs: Vec<BackendConfig> = self
            .backends
            .read()
            .values()
            .map(|b| b.config.clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn pool_stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<(String, PoolStats)> = self
            .backends
            .read()
            .values()
            .map(|b| (b.config.name.clone(), b.pool.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Run one statement on a backend outside any transaction
    pub fn execute_on(&self, name: &str, query: &str) -> Result<ResultSet> {
        let backend = self.get(name)?;
        let mut conn = backend.pool.get()?;
        conn.execute(query).map_err(|source| BackendError::Connection {
            backend: name.to_string(),
            source,
        })
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Persist the current topology so a restart rebuilds the same set
    pub fn flush_config(&self) -> Result<()> {
        let Some(path) = &self.config_file else {
            warn!("No backend config file configured, skipping flush");
            return Ok(());
        };
        let file = BackendsFile {
            backends: self.configs(),
        };
        write_json_atomic(path, &file).map_err(|source| BackendError::ConfigIo {
            path: path.clone(),
            source,
        })
    }
}
