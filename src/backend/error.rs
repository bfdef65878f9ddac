use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a single backend session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("query timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn server(code: u16, message: impl Into<String>) -> Self {
        ConnectionError::Server {
            code,
            message: message.into(),
        }
    }

    /// Whether the session is unusable after this error
    pub fn is_transport(&self) -> bool {
        !matches!(self, ConnectionError::Server { .. })
    }
}

/// Errors from the backend registry and its pools
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend {0} already exists")]
    DuplicateBackend(String),

    #[error("backend {0} not found")]
    UnknownBackend(String),

    #[error("no free connection to backend {0}")]
    PoolExhausted(String),

    #[error("pool for backend {0} is closed")]
    PoolClosed(String),

    #[error("backend {backend}: {source}")]
    Connection {
        backend: String,
        #[source]
        source: ConnectionError,
    },

    #[error("I/O error on backend config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid backend config {path}: {source}")]
    ConfigFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;
