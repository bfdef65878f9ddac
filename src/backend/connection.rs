// Connection abstraction the coordinator drives backends through

use crate::backend::error::ConnectionError;
use crate::common::types::ResultSet;
use crate::config::BackendConfig;

/// One open session to a backend database
pub trait BackendConnection: Send {
    /// Run a single SQL statement and wait for its result
    fn execute(&mut self, query: &str) -> Result<ResultSet, ConnectionError>;
}

/// Opens sessions to backends.
///
/// A MySQL driver plugs in here; tests use [`crate::backend::fakedb::FakeDb`].
pub trait Connector: Send + Sync {
    fn connect(&self, config: &BackendConfig) -> Result<Box<dyn BackendConnection>, ConnectionError>;
}
