use serde::{Deserialize, Serialize};

/// Global transaction identifier shared by every branch of one transaction
pub type Xid = String;

/// A single column value returned by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

impl Value {
    /// Integer view of the value, parsing text if needed
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Result of one or more statements
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

impl ResultSet {
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            rows: Vec::new(),
            rows_affected: 0,
        }
    }

    /// Result of a statement that only reports affected rows
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    pub fn add_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Fold another backend's result into this one
    pub fn merge(&mut self, other: ResultSet) {
        if self.fields.is_empty() {
            self.fields = other.fields;
        }
        self.rows.extend(other.rows);
        self.rows_affected += other.rows_affected;
    }
}

/// Whether a request may modify data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnMode {
    Read,
    #[default]
    Write,
}

/// One rewritten statement and the backend it was routed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTuple {
    pub query: String,
    pub backend: String,
}

impl QueryTuple {
    pub fn new(query: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            backend: backend.into(),
        }
    }
}

/// A routed statement group handed to a transaction by the executor
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub mode: TxnMode,
    pub queries: Vec<QueryTuple>,
}

impl RequestContext {
    pub fn new(mode: TxnMode, queries: Vec<QueryTuple>) -> Self {
        Self { mode, queries }
    }

    pub fn write(queries: Vec<QueryTuple>) -> Self {
        Self::new(TxnMode::Write, queries)
    }

    pub fn read(queries: Vec<QueryTuple>) -> Self {
        Self::new(TxnMode::Read, queries)
    }
}
