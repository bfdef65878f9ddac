// Durable record of transactions whose final outcome is unconfirmed

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::persist::write_json_atomic;
use crate::transaction::xa::timestamp_now;

/// Fixed name of the recovery log inside the configured directory
pub const RECOVERY_LOG_FILE: &str = "xacheck.json";

/// Errors from the recovery log store
#[derive(Error, Debug)]
pub enum RecoveryLogError {
    #[error("xid {0} is already in the recovery log")]
    DuplicateXid(String),

    #[error("xid {0} is not in the recovery log")]
    UnknownXid(String),

    #[error("recovery log {path} is corrupt: {source}")]
    CorruptLog {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on recovery log: {0}")]
    Io(#[from] io::Error),
}

/// Result type for recovery log operations
pub type Result<T> = std::result::Result<T, RecoveryLogError>;

/// Decision the recovery checker must drive a pending branch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveState {
    Commit,
    Rollback,
}

/// One transaction whose phase-2 outcome could not be confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryLogEntry {
    /// Creation time, `%Y%m%d%H%M%S`
    pub time: String,
    pub xaid: String,
    pub state: ResolveState,
}

impl RecoveryLogEntry {
    /// New entry stamped with the current time
    pub fn new(xaid: impl Into<String>, state: ResolveState) -> Self {
        Self {
            time: timestamp_now(),
            xaid: xaid.into(),
            state,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecoveryLogFile {
    #[serde(rename = "xacommit-errs")]
    entries: Vec<RecoveryLogEntry>,
}

/// In-memory list of pending entries mirrored to a JSON file.
///
/// Every mutation rewrites the whole file while holding the store lock, and
/// only reports success once the rewrite is durable. A failed rewrite leaves
/// the in-memory list unchanged.
pub struct RecoveryLogStore {
    path: PathBuf,
    entries: Mutex<Vec<RecoveryLogEntry>>,
}

impl RecoveryLogStore {
    /// Load the log kept in `dir`. A missing file starts an empty log.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(RECOVERY_LOG_FILE);
        let entries = Self::load(&path)?;
        if !entries.is_empty() {
            info!("Loaded {} pending recovery entries from {}", entries.len(), path.display());
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn load(path: &Path) -> Result<Vec<RecoveryLogEntry>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: RecoveryLogFile =
            serde_json::from_slice(&data).map_err(|source| RecoveryLogError::CorruptLog {
                path: path.to_path_buf(),
                source,
            })?;

        let mut entries: Vec<RecoveryLogEntry> = Vec::with_capacity(file.entries.len());
        for entry in file.entries {
            if entries.iter().any(|e| e.xaid == entry.xaid) {
                warn!("Dropping duplicate recovery entry for xid {} in {}", entry.xaid, path.display());
                continue;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn flush(&self, entries: &[RecoveryLogEntry]) -> Result<()> {
        let file = RecoveryLogFile {
            entries: entries.to_vec(),
        };
        write_json_atomic(&self.path, &file)?;
        Ok(())
    }

    /// Append an entry and persist it
    pub fn write(&self, entry: RecoveryLogEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.xaid == entry.xaid) {
            return Err(RecoveryLogError::DuplicateXid(entry.xaid));
        }

        entries.push(entry);
        if let Err(e) = self.flush(&entries) {
            let entry = entries.pop();
            warn!("Failed to persist recovery entry {:?}: {}", entry, e);
            return Err(e);
        }
        Ok(())
    }

    /// Remove the entry for `xaid` and persist
    pub fn remove(&self, xaid: &str) -> Result<RecoveryLogEntry> {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.xaid == xaid)
            .ok_or_else(|| RecoveryLogError::UnknownXid(xaid.to_string()))?;

        let removed = entries.remove(pos);
        if let Err(e) = self.flush(&entries) {
            entries.insert(pos, removed);
            return Err(e);
        }
        Ok(removed)
    }

    /// Remove every entry and persist
    pub fn remove_all(&self) -> Result<usize> {
        let mut entries = self.entries.lock();
        let old = std::mem::take(&mut *entries);
        if let Err(e) = self.flush(&entries) {
            *entries = old;
            return Err(e);
        }
        Ok(old.len())
    }

    /// Snapshot of the current entries
    pub fn list(&self) -> Vec<RecoveryLogEntry> {
        self.entries.lock().clone()
    }

    pub fn contains(&self, xaid: &str) -> bool {
        self.entries.lock().iter().any(|e| e.xaid == xaid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
