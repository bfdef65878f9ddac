// Shardxa: XA two-phase commit coordination for a sharding SQL proxy

pub mod backend;
pub mod common;
pub mod config;
pub mod transaction;

// Re-export key items for convenient access
pub use backend::{BackendConnection, BackendError, BackendRegistry, ConnectionError, Connector};
pub use common::types::{QueryTuple, RequestContext, ResultSet, TxnMode, Value, Xid};
pub use config::{BackendConfig, BackendRole, TxnConfig};
pub use transaction::recovery::{RecoveryChecker, RecoveryLogEntry, RecoveryLogStore, ResolveState};
pub use transaction::{Outcome, Transaction, TransactionError, TransactionManager, TransactionState};
