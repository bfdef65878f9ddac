// Recovery of transactions with unconfirmed phase-2 outcomes

pub mod checker;
pub mod log_store;

// Public exports
pub use checker::{RecoveryChecker, RecoveryListingFailed, TickReport};
pub use log_store::{
    RecoveryLogEntry, RecoveryLogError, RecoveryLogStore, ResolveState, RECOVERY_LOG_FILE,
};
