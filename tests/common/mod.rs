#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use shardxa::backend::fakedb::FakeDb;
use shardxa::{BackendConfig, BackendRegistry, QueryTuple, RequestContext, TransactionManager, TxnConfig};

/// Fake backend fleet plus a scratch directory for the recovery log
pub struct Cluster {
    pub db: FakeDb,
    pub registry: Arc<BackendRegistry>,
    pub config: TxnConfig,
    pub dir: TempDir,
}

impl Cluster {
    pub fn manager(&self) -> Result<TransactionManager> {
        Ok(TransactionManager::init(self.config.clone(), self.registry.clone())?)
    }
}

// Address of the i-th fake backend
pub fn address(i: usize) -> String {
    format!("127.0.0.1:{}", 3306 + i)
}

pub fn backend(i: usize) -> String {
    format!("backend{}", i)
}

/// A cluster whose checker only runs when a test drives it
pub fn create_cluster(backends: usize) -> Result<Cluster> {
    let dir = tempfile::tempdir()?;
    let config = TxnConfig {
        log_directory: dir.path().to_path_buf(),
        tick_interval_ms: 3_600_000,
        checkout_timeout_ms: 200,
        ..TxnConfig::default()
    };
    let db = FakeDb::new();
    let registry = Arc::new(BackendRegistry::new(Arc::new(db.clone()), &config));
    for i in 0..backends {
        registry.add(BackendConfig::new(backend(i), address(i)))?;
    }
    Ok(Cluster {
        db,
        registry,
        config,
        dir,
    })
}

/// One write statement on each listed backend
pub fn writes(backends: &[usize]) -> RequestContext {
    RequestContext::write(
        backends
            .iter()
            .map(|&i| QueryTuple::new(format!("insert into t{} values (1)", i), backend(i)))
            .collect(),
    )
}
