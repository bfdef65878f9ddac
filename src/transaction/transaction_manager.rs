use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::info;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::backend::BackendRegistry;
use crate::config::TxnConfig;
use crate::transaction::recovery::{RecoveryChecker, RecoveryLogEntry, RecoveryLogError, RecoveryLogStore};
use crate::transaction::transaction::{Result, Transaction, TransactionError, TxnContext};
use crate::transaction::xa::XidGenerator;

/// Transaction manager - creates transactions and owns crash recovery
pub struct TransactionManager {
    config: TxnConfig,

    /// Backends transactions are routed to
    registry: Arc<BackendRegistry>,

    /// Pending entries shared with the checker and every transaction
    store: Arc<RecoveryLogStore>,

    checker: RecoveryChecker,

    xids: Arc<XidGenerator>,

    /// Held shared by each commit, exclusively by `lock_commits`
    commit_lock: Arc<RwLock<()>>,

    /// Transactions created and not yet finished
    active: Arc<AtomicUsize>,
}

impl TransactionManager {
    /// Load the recovery log and start the recovery checker.
    ///
    /// Fails if the log exists but cannot be parsed; nothing is started then.
    pub fn init(config: TxnConfig, registry: Arc<BackendRegistry>) -> Result<Self> {
        fs::create_dir_all(&config.log_directory).map_err(RecoveryLogError::from)?;
        let store = Arc::new(RecoveryLogStore::open(&config.log_directory)?);

        let checker = RecoveryChecker::new(store.clone(), registry.clone(), config.tick_interval());
        checker
            .start()
            .map_err(|e| TransactionError::Internal(format!("cannot start recovery checker: {}", e)))?;

        info!(
            "Transaction manager started, recovery log {} with {} pending entries",
            store.path().display(),
            store.len()
        );

        Ok(Self {
            xids: Arc::new(XidGenerator::new(config.xid_prefix.clone())),
            config,
            registry,
            store,
            checker,
            commit_lock: Arc::new(RwLock::new(())),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Stop the recovery checker. Idempotent.
    pub fn close(&self) {
        if self.checker.is_running() {
            self.checker.close();
            info!("Transaction manager closed");
        }
    }

    /// A fresh transaction in the `Idle` state
    pub fn create_transaction(&self) -> Transaction {
        Transaction::new(TxnContext {
            registry: self.registry.clone(),
            store: self.store.clone(),
            xids: self.xids.clone(),
            commit_lock: self.commit_lock.clone(),
            active: self.active.clone(),
        })
    }

    /// Block new commits until the guard is dropped; waits for in-flight ones
    pub fn lock_commits(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_lock.write()
    }

    pub fn active_transactions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn recovery_entries(&self) -> Vec<RecoveryLogEntry> {
        self.store.list()
    }

    /// Drop one pending entry without resolving it
    pub fn remove_recovery_entry(&self, xaid: &str) -> Result<RecoveryLogEntry> {
        Ok(self.store.remove(xaid)?)
    }

    pub fn remove_all_recovery_entries(&self) -> Result<usize> {
        Ok(self.store.remove_all()?)
    }

    pub fn recovery_log_path(&self) -> &Path {
        self.store.path()
    }

    pub fn recovery_store(&self) -> &Arc<RecoveryLogStore> {
        &self.store
    }

    pub fn checker(&self) -> &RecoveryChecker {
        &self.checker
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.close();
    }
}
