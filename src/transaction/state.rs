// ============================================================================
// Transaction State Management
// ============================================================================
//
// Each transaction moves through: Active -> Committed/Aborted
//
// Row versions written by an open transaction are tagged with its id. Other
// transactions skip pending inserts when reading and wait on them when they
// would collide on a primary key.
//
// ============================================================================

use super::Change;
use crate::core::{MigrationError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Unique identifier for a transaction within one store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Per-store id allocator.
#[derive(Debug)]
pub struct TransactionIds {
    next: AtomicU64,
}

impl TransactionIds {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn next(&self) -> TransactionId {
        TransactionId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TransactionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    changes: Vec<Change>,
    /// Referential checks are suspended while set.
    relaxed: bool,
    statement_timeout: Duration,
    start_time: Instant,
}

impl Transaction {
    pub fn new(id: TransactionId, statement_timeout: Duration) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            changes: Vec::new(),
            relaxed: false,
            statement_timeout,
            start_time: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn is_relaxed(&self) -> bool {
        self.relaxed
    }

    pub fn set_relaxed(&mut self, relaxed: bool) {
        self.relaxed = relaxed;
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_change(&mut self, change: Change) -> Result<()> {
        self.ensure_active("record change")?;
        self.changes.push(change);
        Ok(())
    }

    /// Marks the transaction committed and hands back its change list.
    pub fn commit(&mut self) -> Result<Vec<Change>> {
        self.ensure_active("commit")?;
        self.state = TransactionState::Committed;
        Ok(std::mem::take(&mut self.changes))
    }

    /// Marks the transaction aborted and hands back what must be undone.
    pub fn rollback(&mut self) -> Result<Vec<Change>> {
        self.ensure_active("rollback")?;
        self.state = TransactionState::Aborted;
        Ok(std::mem::take(&mut self.changes))
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if !self.state.is_active() {
            return Err(MigrationError::Invariant(format!(
                "cannot {}: transaction {} is already {}",
                action, self.id, self.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Registry, TableId};

    fn txn() -> Transaction {
        Transaction::new(TransactionIds::new().next(), Duration::from_secs(1))
    }

    #[test]
    fn test_transaction_id_generation() {
        let ids = TransactionIds::new();
        let id1 = ids.next();
        let id2 = ids.next();
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_transaction_lifecycle() {
        let mut txn = txn();
        assert!(txn.state().is_active());

        txn.commit().unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.state().is_terminal());
    }

    #[test]
    fn test_cannot_commit_twice() {
        let mut txn = txn();
        txn.commit().unwrap();
        assert!(txn.commit().is_err());
        assert!(txn.rollback().is_err());
    }

    #[test]
    fn test_rollback_returns_changes() {
        let mut txn = txn();
        let table = TableId::base(Registry::Fz44);
        txn.record_change(Change::DeleteRow { table, id: 1 }).unwrap();

        let undone = txn.rollback().unwrap();
        assert_eq!(undone.len(), 1);
        assert!(txn.changes().is_empty());
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_cannot_record_change_after_commit() {
        let mut txn = txn();
        txn.commit().unwrap();
        let change = Change::DeleteLink { link_id: 1 };
        assert!(txn.record_change(change).is_err());
    }
}
