// Scriptable in-memory backend used by tests and benchmarks
//
// Rules are matched newest first. A query with no matching rule succeeds
// with an empty result, so an XA RECOVER with no rule lists nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::connection::{BackendConnection, Connector};
use crate::backend::error::ConnectionError;
use crate::common::types::{ResultSet, Value};
use crate::config::BackendConfig;

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Prefix(String),
}

impl Matcher {
    fn matches(&self, query: &str) -> bool {
        match self {
            Matcher::Exact(q) => q == query,
            Matcher::Prefix(p) => query.starts_with(p.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Rows(ResultSet),
    Fail(ConnectionError),
}

/// How the fake backend answers a family of queries
#[derive(Debug, Clone)]
pub struct FakeRule {
    matcher: Matcher,
    address: Option<String>,
    reply: Reply,
    delay: Option<Duration>,
    once: bool,
}

impl FakeRule {
    fn with_matcher(matcher: Matcher) -> Self {
        Self {
            matcher,
            address: None,
            reply: Reply::Rows(ResultSet::default()),
            delay: None,
            once: false,
        }
    }

    pub fn exact(query: impl Into<String>) -> Self {
        Self::with_matcher(Matcher::Exact(query.into()))
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::with_matcher(Matcher::Prefix(prefix.into()))
    }

    /// Only apply to the backend at `address`
    pub fn on(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn result(mut self, rs: ResultSet) -> Self {
        self.reply = Reply::Rows(rs);
        self
    }

    pub fn error(mut self, code: u16, message: impl Into<String>) -> Self {
        self.reply = Reply::Fail(ConnectionError::server(code, message));
        self
    }

    pub fn timeout(mut self) -> Self {
        self.reply = Reply::Fail(ConnectionError::Timeout);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Remove the rule after it answers once
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    fn applies(&self, address: &str, query: &str) -> bool {
        self.address.as_deref().is_none_or(|a| a == address) && self.matcher.matches(query)
    }
}

#[derive(Default)]
struct FakeState {
    rules: Vec<FakeRule>,
    journal: HashMap<String, Vec<String>>,
    connects: HashMap<String, usize>,
    refused: HashSet<String>,
}

/// A fleet of fake backends keyed by address
#[derive(Clone, Default)]
pub struct FakeDb {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, rule: FakeRule) {
        self.state.lock().rules.push(rule);
    }

    /// Drop every rule and the query journal
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.rules.clear();
        state.journal.clear();
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    /// Every statement the backend at `address` received, in order
    pub fn queries(&self, address: &str) -> Vec<String> {
        self.state
            .lock()
            .journal
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Statements received by `address` that start with `prefix`
    pub fn queries_with_prefix(&self, address: &str, prefix: &str) -> Vec<String> {
        self.queries(address)
            .into_iter()
            .filter(|q| q.starts_with(prefix))
            .collect()
    }

    /// Number of sessions opened to `address`
    pub fn connects(&self, address: &str) -> usize {
        self.state.lock().connects.get(address).copied().unwrap_or(0)
    }

    pub fn refuse_connections(&self, address: &str, refuse: bool) {
        let mut state = self.state.lock();
        if refuse {
            state.refused.insert(address.to_string());
        } else {
            state.refused.remove(address);
        }
    }

    fn answer(&self, address: &str, query: &str) -> Result<ResultSet, ConnectionError> {
        let (reply, delay) = {
            let mut state = self.state.lock();
            state
                .journal
                .entry(address.to_string())
                .or_default()
                .push(query.to_string());

            match state.rules.iter().rposition(|r| r.applies(address, query)) {
                Some(idx) => {
                    let rule = if state.rules[idx].once {
                        state.rules.remove(idx)
                    } else {
                        state.rules[idx].clone()
                    };
                    (rule.reply, rule.delay)
                }
                None => (Reply::Rows(ResultSet::default()), None),
            }
        };

        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        match reply {
            Reply::Rows(rs) => Ok(rs),
            Reply::Fail(e) => Err(e),
        }
    }
}

impl Connector for FakeDb {
    fn connect(&self, config: &BackendConfig) -> Result<Box<dyn BackendConnection>, ConnectionError> {
        let mut state = self.state.lock();
        if state.refused.contains(&config.address) {
            return Err(ConnectionError::Io(format!("connection refused: {}", config.address)));
        }
        *state.connects.entry(config.address.clone()).or_default() += 1;
        Ok(Box::new(FakeConnection {
            db: self.clone(),
            address: config.address.clone(),
        }))
    }
}

struct FakeConnection {
    db: FakeDb,
    address: String,
}

impl BackendConnection for FakeConnection {
    fn execute(&mut self, query: &str) -> Result<ResultSet, ConnectionError> {
        self.db.answer(&self.address, query)
    }
}

/// Rows an `XA RECOVER` returns for the given prepared xids
pub fn recover_result(xids: &[&str]) -> ResultSet {
    let mut rs = ResultSet::new(vec![
        "formatID".to_string(),
        "gtrid_length".to_string(),
        "bqual_length".to_string(),
        "data".to_string(),
    ]);
    for xid in xids {
        rs.add_row(vec![
            Value::Int(1),
            Value::Int(xid.len() as i64),
            Value::Int(0),
            Value::Text(xid.to_string()),
        ]);
    }
    rs.rows_affected = xids.len() as u64;
    rs
}
