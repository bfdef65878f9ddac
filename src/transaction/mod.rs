// Distributed transaction coordination

pub mod recovery;
pub mod transaction;
pub mod transaction_manager;
pub mod xa;

// Public exports
pub use transaction::{Outcome, Transaction, TransactionError, TransactionState};
pub use transaction_manager::TransactionManager;
pub use xa::{XaCommand, XidGenerator};
