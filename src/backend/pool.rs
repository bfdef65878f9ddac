// Bounded per-backend connection pool with exclusive checkout

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::backend::connection::{BackendConnection, Connector};
use crate::backend::error::{BackendError, ConnectionError, Result};
use crate::common::types::ResultSet;
use crate::config::BackendConfig;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct PoolState {
    idle: VecDeque<Box<dyn BackendConnection>>,
    in_use: usize,
    closed: bool,
}

struct PoolInner {
    config: BackendConfig,
    max: usize,
    checkout_timeout: Duration,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn release(&self, conn: Box<dyn BackendConnection>, reusable: bool) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if reusable && !state.closed {
            state.idle.push_back(conn);
        } else {
            debug!("Discarding connection to backend {}", self.config.name);
            drop(conn);
        }
        self.available.notify_one();
    }
}

/// Pool of sessions to one backend.
///
/// At most `max` sessions exist at a time, idle or checked out. A checked-out
/// session is owned by exactly one [`PooledConnection`] until it is returned.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        config: BackendConfig,
        max: usize,
        checkout_timeout: Duration,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                max: max.max(1),
                checkout_timeout,
                connector,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Name of the backend this pool serves
    pub fn backend(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    /// Check out a session, opening one if the pool is below its bound.
    ///
    /// Waits up to the checkout timeout when every session is in use.
    pub fn get(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.checkout_timeout;
        let mut state = inner.state.lock();

        loop {
            if state.closed {
                return Err(BackendError::PoolClosed(inner.config.name.clone()));
            }

            if let Some(conn) = state.idle.pop_front() {
                state.in_use += 1;
                return Ok(PooledConnection::new(inner.clone(), conn));
            }

            if state.in_use < inner.max {
                // Reserve the slot, then dial without holding the lock
                state.in_use += 1;
                drop(state);

                return match inner.connector.connect(&inner.config) {
                    Ok(conn) => Ok(PooledConnection::new(inner.clone(), conn)),
                    Err(source) => {
                        let mut state = inner.state.lock();
                        state.in_use -= 1;
                        inner.available.notify_one();
                        warn!("Failed to connect to backend {}: {}", inner.config.name, source);
                        Err(BackendError::Connection {
                            backend: inner.config.name.clone(),
                            source,
                        })
                    }
                };
            }

            if inner.available.wait_until(&mut state, deadline).timed_out() {
                return Err(BackendError::PoolExhausted(inner.config.name.clone()));
            }
        }
    }

    /// Drop idle sessions and refuse further checkouts
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.idle.clear();
        self.inner.available.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            max: self.inner.max,
            idle: state.idle.len(),
            in_use: state.in_use,
        }
    }
}

/// A checked-out session. Returned to its pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Box<dyn BackendConnection>>,
    broken: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Box<dyn BackendConnection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    pub fn backend(&self) -> &str {
        &self.pool.config.name
    }

    /// Run a statement; transport failures mark the session for discard
    pub fn execute(&mut self, query: &str) -> std::result::Result<ResultSet, ConnectionError> {
        let conn = self.conn.as_mut().ok_or(ConnectionError::Closed)?;
        let result = conn.execute(query);
        if let Err(e) = &result {
            if e.is_transport() {
                self.broken = true;
            }
        }
        result
    }

    /// Close the session instead of returning it to the pool
    pub fn discard(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, !self.broken);
        }
    }
}
