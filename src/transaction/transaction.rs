// Transaction - one logical client transaction fanned out over backend branches

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use linked_hash_map::LinkedHashMap;
use log::{debug, error, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::backend::{BackendError, BackendRegistry, ConnectionError, PooledConnection};
use crate::common::types::{QueryTuple, RequestContext, ResultSet, TxnMode, Xid};
use crate::transaction::recovery::{RecoveryLogEntry, RecoveryLogError, RecoveryLogStore, ResolveState};
use crate::transaction::xa::{XaCommand, XidGenerator};

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Began,
    Executing,
    Preparing,
    Prepared,
    Aborting,
    Committing,
    RollingBack,
    Finished,
}

/// How a commit or rollback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
    /// Some branch could not confirm phase 2; a recovery entry was written
    Indeterminate,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("backend {backend}: {source}")]
    Backend {
        backend: String,
        #[source]
        source: ConnectionError,
    },

    #[error(transparent)]
    Registry(#[from] BackendError),

    #[error("prepare failed on backend {backend}: {source}")]
    PrepareFailed {
        backend: String,
        #[source]
        source: ConnectionError,
    },

    #[error("transaction {xid} is in state {state:?}")]
    InvalidState { xid: Xid, state: TransactionState },

    #[error("failed to record unresolved transaction: {0}")]
    RecoveryLog(#[from] RecoveryLogError),

    #[error("internal transaction error: {0}")]
    Internal(String),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Progress of one backend's branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    /// Enlisted without XA START (read-only so far)
    Idle,
    Active,
    Ended,
    Prepared,
    /// Told to commit or roll back; nothing more is sent
    Done,
}

struct Branch {
    conn: PooledConnection,
    state: BranchState,
}

impl Branch {
    fn send(&mut self, command: XaCommand<'_>) -> std::result::Result<ResultSet, ConnectionError> {
        debug!("{} -> {}", self.conn.backend(), command);
        self.conn.execute(&command.to_string())
    }

    fn run_statements(
        &mut self,
        xid: &str,
        mode: TxnMode,
        queries: &[&str],
    ) -> std::result::Result<ResultSet, ConnectionError> {
        if mode == TxnMode::Write && self.state == BranchState::Idle {
            self.send(XaCommand::Start(xid))?;
            self.state = BranchState::Active;
        }

        let mut merged = ResultSet::default();
        for query in queries {
            merged.merge(self.conn.execute(query)?);
        }
        Ok(merged)
    }

    fn end_and_prepare(&mut self, xid: &str) -> std::result::Result<(), ConnectionError> {
        if self.state == BranchState::Active {
            self.send(XaCommand::End(xid))?;
            self.state = BranchState::Ended;
        }
        self.send(XaCommand::Prepare(xid))?;
        self.state = BranchState::Prepared;
        Ok(())
    }

    /// Roll the branch back; returns the state it was in if that failed
    fn rollback(&mut self, xid: &str) -> Option<BranchState> {
        let prior = self.state;
        if matches!(prior, BranchState::Idle | BranchState::Done) {
            return None;
        }
        self.state = BranchState::Done;

        if prior == BranchState::Active {
            if let Err(e) = self.send(XaCommand::End(xid)) {
                warn!("XA END before rollback failed on {}: {}", self.conn.backend(), e);
            }
        }
        match self.send(XaCommand::Rollback(xid)) {
            Ok(_) => None,
            Err(e) => {
                warn!("XA ROLLBACK failed on {} for {}: {}", self.conn.backend(), xid, e);
                // Closing the session rolls back a branch that never prepared
                self.conn.discard();
                Some(prior)
            }
        }
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            BranchState::Active | BranchState::Ended | BranchState::Prepared
        )
    }
}

/// Collaborators a transaction borrows from its manager
#[derive(Clone)]
pub(crate) struct TxnContext {
    pub(crate) registry: Arc<BackendRegistry>,
    pub(crate) store: Arc<RecoveryLogStore>,
    pub(crate) xids: Arc<XidGenerator>,
    pub(crate) commit_lock: Arc<RwLock<()>>,
    pub(crate) active: Arc<AtomicUsize>,
}

/// A distributed transaction driven with XA two-phase commit.
///
/// Backends are enlisted lazily: the first statement routed to a backend checks
/// out a pooled connection and opens the branch with `XA START`. Participants
/// are kept in first-touch order, and every phase walks them in that order.
pub struct Transaction {
    ctx: TxnContext,
    xid: Xid,
    state: TransactionState,
    outcome: Option<Outcome>,
    branches: LinkedHashMap<String, Branch>,
}

impl Transaction {
    pub(crate) fn new(ctx: TxnContext) -> Self {
        ctx.active.fetch_add(1, Ordering::SeqCst);
        Self {
            ctx,
            xid: Xid::new(),
            state: TransactionState::Idle,
            outcome: None,
            branches: LinkedHashMap::new(),
        }
    }

    fn invalid_state(&self) -> TransactionError {
        TransactionError::InvalidState {
            xid: self.xid.clone(),
            state: self.state,
        }
    }

    /// Allocate the xid. No backend is contacted yet.
    pub fn begin(&mut self) -> Result<()> {
        if self.state != TransactionState::Idle {
            return Err(self.invalid_state());
        }
        self.xid = self.ctx.xids.next_xid();
        self.state = TransactionState::Began;
        debug!("Transaction {} began", self.xid);
        Ok(())
    }

    /// Run routed statements, enlisting any backend touched for the first time
    pub fn execute(&mut self, rctx: &RequestContext) -> Result<ResultSet> {
        if !matches!(self.state, TransactionState::Began | TransactionState::Executing) {
            return Err(self.invalid_state());
        }
        self.state = TransactionState::Executing;

        let mut groups: LinkedHashMap<String, Vec<&str>> = LinkedHashMap::new();
        for tuple in &rctx.queries {
            groups
                .entry(tuple.backend.clone())
                .or_insert_with(Vec::new)
                .push(tuple.query.as_str());
        }

        for name in groups.keys() {
            if !self.branches.contains_key(name) {
                let backend = self.ctx.registry.get(name)?;
                let conn = backend.pool().get()?;
                self.branches.insert(
                    name.clone(),
                    Branch {
                        conn,
                        state: BranchState::Idle,
                    },
                );
            }
        }

        let xid = self.xid.as_str();
        let mode = rctx.mode;
        let targets = self
            .branches
            .iter_mut()
            .filter_map(|(name, branch)| groups.get(name).map(|queries| (name, branch, queries)));

        let results: Vec<(String, std::result::Result<ResultSet, ConnectionError>)> = if groups.len() == 1 {
            targets
                .map(|(name, branch, queries)| (name.clone(), branch.run_statements(xid, mode, queries)))
                .collect()
        } else {
            // Different backends are independent; dispatch them in parallel
            crossbeam::thread::scope(|s| {
                let handles: Vec<_> = targets
                    .map(|(name, branch, queries)| {
                        (name.clone(), s.spawn(move |_| branch.run_statements(xid, mode, queries)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(name, handle)| {
                        let result = handle
                            .join()
                            .unwrap_or_else(|_| Err(ConnectionError::Io("executor thread panicked".to_string())));
                        (name, result)
                    })
                    .collect()
            })
            .map_err(|_| TransactionError::Internal("executor scope panicked".to_string()))?
        };

        let mut merged = ResultSet::default();
        for (backend, result) in results {
            match result {
                Ok(rs) => merged.merge(rs),
                Err(source) => return Err(TransactionError::Backend { backend, source }),
            }
        }
        Ok(merged)
    }

    /// Send the same statement to every registered backend
    pub fn execute_scatter(&mut self, query: &str) -> Result<ResultSet> {
        let queries = self
            .ctx
            .registry
            .names()
            .into_iter()
            .map(|backend| QueryTuple::new(query, backend))
            .collect();
        self.execute(&RequestContext::write(queries))
    }

    /// Commit the transaction.
    ///
    /// No branch: nothing to do. One branch: a local one-phase commit. Two or
    /// more: full two-phase commit. A phase-2 failure is not reported to the
    /// caller; it is recorded in the recovery log and repaired later.
    pub fn commit(&mut self) -> Result<()> {
        if !matches!(self.state, TransactionState::Began | TransactionState::Executing) {
            return Err(self.invalid_state());
        }

        let commit_lock = self.ctx.commit_lock.clone();
        let _guard = commit_lock.read();

        let participants: Vec<String> = self
            .branches
            .iter()
            .filter(|(_, b)| b.state == BranchState::Active)
            .map(|(name, _)| name.clone())
            .collect();

        match participants.len() {
            0 => {
                self.state = TransactionState::Committing;
                self.outcome = Some(Outcome::Committed);
                Ok(())
            }
            1 => self.commit_one_phase(&participants[0]),
            _ => self.commit_two_phase(&participants),
        }
    }

    fn branch_mut(&mut self, name: &str) -> Result<&mut Branch> {
        self.branches
            .get_mut(name)
            .ok_or_else(|| TransactionError::Internal(format!("no branch for backend {}", name)))
    }

    fn commit_one_phase(&mut self, name: &str) -> Result<()> {
        self.state = TransactionState::Committing;
        let xid = self.xid.clone();
        let branch = self.branch_mut(name)?;

        if let Err(source) = branch.send(XaCommand::End(&xid)) {
            branch.rollback(&xid);
            self.state = TransactionState::RollingBack;
            self.outcome = Some(Outcome::RolledBack);
            return Err(TransactionError::Backend {
                backend: name.to_string(),
                source,
            });
        }

        branch.state = BranchState::Done;
        match branch.send(XaCommand::CommitOnePhase(&xid)) {
            Ok(_) => {
                self.outcome = Some(Outcome::Committed);
                Ok(())
            }
            Err(source) => {
                error!("One-phase commit of {} failed on {}: {}", xid, name, source);
                // The session may still hold the ended branch
                branch.conn.discard();
                Err(TransactionError::Backend {
                    backend: name.to_string(),
                    source,
                })
            }
        }
    }

    fn commit_two_phase(&mut self, participants: &[String]) -> Result<()> {
        let xid = self.xid.clone();

        // Phase 1
        self.state = TransactionState::Preparing;
        for name in participants {
            if let Err(source) = self.branch_mut(name)?.end_and_prepare(&xid) {
                warn!("Prepare of {} failed on {}: {}", xid, name, source);
                return self.abort_prepare(name, source);
            }
        }
        self.state = TransactionState::Prepared;

        // Phase 2
        self.state = TransactionState::Committing;
        let mut unconfirmed = Vec::new();
        for name in participants {
            let branch = self.branch_mut(name)?;
            branch.state = BranchState::Done;
            if let Err(e) = branch.send(XaCommand::Commit(&xid)) {
                warn!("XA COMMIT of {} unconfirmed on {}: {}", xid, name, e);
                branch.conn.discard();
                unconfirmed.push(name.as_str());
            }
        }

        if unconfirmed.is_empty() {
            self.outcome = Some(Outcome::Committed);
            return Ok(());
        }

        self.outcome = Some(Outcome::Indeterminate);
        self.ctx
            .store
            .write(RecoveryLogEntry::new(xid.as_str(), ResolveState::Commit))?;
        warn!(
            "Transaction {} logged for recovery, commit unconfirmed on {:?}",
            xid, unconfirmed
        );
        Ok(())
    }

    fn abort_prepare(&mut self, failed: &str, source: ConnectionError) -> Result<()> {
        self.state = TransactionState::Aborting;
        let xid = self.xid.clone();
        // A prepare that got no answer may still have been applied
        let maybe_prepared = source.is_transport();
        let unrolled: Vec<(String, BranchState)> = self
            .branches
            .iter_mut()
            .filter_map(|(name, b)| b.rollback(&xid).map(|prior| (name.clone(), prior)))
            .collect();
        let orphaned = unrolled.iter().any(|(name, prior)| {
            *prior == BranchState::Prepared
                || (maybe_prepared && name == failed && *prior == BranchState::Ended)
        });

        self.state = TransactionState::RollingBack;
        self.outcome = Some(Outcome::RolledBack);
        if orphaned {
            // A prepared branch survived the abort and must be rolled back later
            self.outcome = Some(Outcome::Indeterminate);
            self.ctx
                .store
                .write(RecoveryLogEntry::new(xid.as_str(), ResolveState::Rollback))?;
        }

        Err(TransactionError::PrepareFailed {
            backend: failed.to_string(),
            source,
        })
    }

    /// Roll back every open branch
    pub fn rollback(&mut self) -> Result<()> {
        if !matches!(self.state, TransactionState::Began | TransactionState::Executing) {
            return Err(self.invalid_state());
        }
        self.state = TransactionState::RollingBack;

        let xid = self.xid.clone();
        let unconfirmed: Vec<String> = self
            .branches
            .iter_mut()
            .filter_map(|(name, b)| b.rollback(&xid).map(|_| name.clone()))
            .collect();

        if unconfirmed.is_empty() {
            self.outcome = Some(Outcome::RolledBack);
            return Ok(());
        }

        self.outcome = Some(Outcome::Indeterminate);
        self.ctx
            .store
            .write(RecoveryLogEntry::new(xid.as_str(), ResolveState::Rollback))?;
        warn!(
            "Transaction {} logged for recovery, rollback unconfirmed on {:?}",
            xid, unconfirmed
        );
        Ok(())
    }

    /// Return every connection to its pool. Safe to call at any point, any number of times.
    ///
    /// A connection whose branch is still open is closed instead of reused, so
    /// the backend drops the unfinished branch with the session.
    pub fn finish(&mut self) {
        if self.state == TransactionState::Finished {
            return;
        }
        while let Some((name, mut branch)) = self.branches.pop_front() {
            if branch.is_open() {
                warn!("Transaction {} finished with branch on {} still open", self.xid, name);
                branch.conn.discard();
            }
        }
        self.state = TransactionState::Finished;
        self.ctx.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn xid(&self) -> &str {
        &self.xid
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Backends touched so far, in first-touch order
    pub fn participants(&self) -> Vec<String> {
        self.branches.keys().cloned().collect()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}
