// Background reconciliation of the recovery log against backend XA state

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use crossbeam::select;
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::backend::{BackendError, BackendRegistry, ConnectionError};
use crate::transaction::recovery::log_store::{RecoveryLogEntry, RecoveryLogStore, ResolveState};
use crate::transaction::xa::{parse_recover_result, XaCommand};

/// A backend could not list its prepared branches this tick
#[derive(Error, Debug)]
pub enum RecoveryListingFailed {
    #[error("backend {backend} unavailable: {source}")]
    Unavailable {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("XA RECOVER failed on backend {backend}: {source}")]
    Listing {
        backend: String,
        #[source]
        source: ConnectionError,
    },
}

/// What one checker pass did with each entry
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Found prepared on some backend, resolved there, then removed
    pub resolved: Vec<String>,
    /// Found on no backend, removed without sending anything
    pub discarded: Vec<String>,
    /// Left in the log for the next tick
    pub pending: Vec<String>,
}

struct CheckerState {
    store: Arc<RecoveryLogStore>,
    registry: Arc<BackendRegistry>,
    ticks: AtomicU64,
}

impl CheckerState {
    fn list_prepared(&self, backend: &str) -> Result<HashSet<String>, RecoveryListingFailed> {
        let unavailable = |source| RecoveryListingFailed::Unavailable {
            backend: backend.to_string(),
            source,
        };
        let target = self.registry.get(backend).map_err(unavailable)?;
        let mut conn = target.pool().get().map_err(unavailable)?;
        let rs = conn
            .execute(&XaCommand::Recover.to_string())
            .map_err(|source| RecoveryListingFailed::Listing {
                backend: backend.to_string(),
                source,
            })?;
        Ok(parse_recover_result(&rs).into_iter().collect())
    }

    fn resolve(&self, backend: &str, entry: &RecoveryLogEntry) -> Result<(), BackendError> {
        let command = match entry.state {
            ResolveState::Commit => XaCommand::Commit(&entry.xaid),
            ResolveState::Rollback => XaCommand::Rollback(&entry.xaid),
        };
        self.registry.execute_on(backend, &command.to_string())?;
        Ok(())
    }

    fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let entries = self.store.list();
        let backends = self.registry.names();

        if entries.is_empty() {
            return report;
        }
        if backends.is_empty() {
            // Nothing to reconcile against; never treat that as "absent everywhere"
            debug!("No backends registered, keeping {} recovery entries", entries.len());
            report.pending = entries.into_iter().map(|e| e.xaid).collect();
            return report;
        }

        let mut listings = HashMap::with_capacity(backends.len());
        for backend in &backends {
            let listing = self.list_prepared(backend);
            if let Err(e) = &listing {
                warn!("Recovery listing skipped: {}", e);
            }
            listings.insert(backend.as_str(), listing);
        }

        for entry in entries {
            let mut settled = true;
            let mut found = false;

            for backend in &backends {
                match &listings[backend.as_str()] {
                    Err(_) => settled = false,
                    Ok(xids) if xids.contains(&entry.xaid) => {
                        found = true;
                        match self.resolve(backend, &entry) {
                            Ok(()) => info!(
                                "Resolved xid {} on backend {} with {:?}",
                                entry.xaid, backend, entry.state
                            ),
                            Err(e) => {
                                warn!("Failed to resolve xid {} on backend {}: {}", entry.xaid, backend, e);
                                settled = false;
                            }
                        }
                    }
                    Ok(_) => {}
                }
            }

            if !settled {
                report.pending.push(entry.xaid);
                continue;
            }

            match self.store.remove(&entry.xaid) {
                Ok(_) if found => report.resolved.push(entry.xaid),
                Ok(_) => {
                    info!("Xid {} is prepared on no backend, discarding", entry.xaid);
                    report.discarded.push(entry.xaid);
                }
                Err(e) => {
                    warn!("Failed to remove recovery entry {}: {}", entry.xaid, e);
                    report.pending.push(entry.xaid);
                }
            }
        }
        report
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically drives pending recovery entries to their logged decision.
///
/// The checker keeps no state between ticks: every tick re-reads the log and
/// re-lists every backend, so a restart simply resumes where it left off.
pub struct RecoveryChecker {
    state: Arc<CheckerState>,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl RecoveryChecker {
    pub fn new(store: Arc<RecoveryLogStore>, registry: Arc<BackendRegistry>, interval: Duration) -> Self {
        Self {
            state: Arc::new(CheckerState {
                store,
                registry,
                ticks: AtomicU64::new(0),
            }),
            interval,
            worker: Mutex::new(None),
        }
    }

    /// Start the background loop. Does nothing if it is already running.
    pub fn start(&self) -> io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let state = self.state.clone();
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("xa-recovery".to_string())
            .spawn(move || {
                let ticker = channel::tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let report = state.tick();
                            if !report.pending.is_empty() {
                                debug!("{} recovery entries still pending", report.pending.len());
                            }
                            state.ticks.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            })?;

        *worker = Some(Worker { stop: stop_tx, handle });
        Ok(())
    }

    /// Stop the loop and wait for an in-flight tick to finish
    pub fn close(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // Disconnecting the channel wakes the loop
        drop(worker.stop);
        if worker.handle.join().is_err() {
            warn!("Recovery checker thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Run one reconciliation pass on the calling thread
    pub fn run_once(&self) -> TickReport {
        self.state.tick()
    }

    /// Number of passes the background loop has completed
    pub fn ticks(&self) -> u64 {
        self.state.ticks.load(Ordering::SeqCst)
    }
}

impl Drop for RecoveryChecker {
    fn drop(&mut self) {
        self.close();
    }
}
