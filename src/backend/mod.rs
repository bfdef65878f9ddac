// Backend access: connection abstraction, pools and the registry

pub mod connection;
pub mod error;
pub mod fakedb;
pub mod pool;
pub mod registry;

// Public exports
pub use connection::{BackendConnection, Connector};
pub use error::{BackendError, ConnectionError};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use registry::{Backend, BackendRegistry, BackendsFile, BACKEND_CONFIG_FILE};
