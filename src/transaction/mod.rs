// ============================================================================
// Transaction bookkeeping for the in-memory stage store
// ============================================================================
//
// Each open transaction records the row versions it created or marked for
// deletion. Commit makes them permanent, rollback discards them, and both
// wake anyone waiting on those rows.
//
// ============================================================================

pub mod change;
pub mod state;

pub use change::Change;
pub use state::{Transaction, TransactionId, TransactionIds, TransactionState};
