use crate::core::{ContractId, ContractRecord, MigrationError, Result, TableId};
use crate::transaction::TransactionId;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One row plus the transactions that have a pending claim on it.
///
/// `xmin` is set while the inserting transaction is open; `xmax` while a
/// deleting transaction is open. A row with neither is committed and
/// unlocked.
#[derive(Debug, Clone)]
pub struct MvccRow {
    pub record: ContractRecord,
    pub xmin: Option<TransactionId>,
    pub xmax: Option<TransactionId>,
}

impl MvccRow {
    fn is_locked(&self) -> bool {
        self.xmin.is_some() || self.xmax.is_some()
    }
}

pub type CheckFn = Arc<dyn Fn(&ContractRecord) -> bool + Send + Sync>;

/// A row-level CHECK constraint.
#[derive(Clone)]
pub struct CheckConstraint {
    name: String,
    check: CheckFn,
}

impl fmt::Debug for CheckConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckConstraint").field("name", &self.name).finish()
    }
}

/// A stage table keyed by contract id.
#[derive(Debug, Clone)]
pub struct StageTable {
    id: TableId,
    rows: BTreeMap<ContractId, MvccRow>,
    checks: Vec<CheckConstraint>,
}

impl StageTable {
    pub fn new(id: TableId) -> Self {
        Self {
            id,
            rows: BTreeMap::new(),
            checks: Vec::new(),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn add_check(&mut self, name: impl Into<String>, check: CheckFn) {
        self.checks.push(CheckConstraint { name: name.into(), check });
    }

    /// Inserts an already-committed row, as ingestion would.
    pub fn seed(&mut self, record: ContractRecord) -> Result<()> {
        self.validate(&record)?;
        if self.rows.contains_key(&record.id) {
            return Err(self.duplicate(record.id));
        }
        self.rows.insert(record.id, MvccRow { record, xmin: None, xmax: None });
        Ok(())
    }

    /// Row as seen by `tx`: committed rows plus its own pending inserts,
    /// minus its own pending deletes. `None` reads committed state only.
    pub fn visible(&self, id: ContractId, tx: Option<TransactionId>) -> Option<&ContractRecord> {
        let row = self.rows.get(&id)?;
        let created = row.xmin.is_none() || row.xmin == tx;
        let deleted = tx.is_some() && row.xmax == tx;
        (created && !deleted).then_some(&row.record)
    }

    pub fn row(&self, id: ContractId) -> Option<&MvccRow> {
        self.rows.get(&id)
    }

    /// Committed rows in id order.
    pub fn committed(&self) -> impl Iterator<Item = &ContractRecord> {
        self.rows
            .values()
            .filter(|row| row.xmin.is_none())
            .map(|row| &row.record)
    }

    pub fn committed_len(&self) -> usize {
        self.committed().count()
    }

    /// Another transaction whose outcome decides whether `tx` may claim `id`.
    pub fn blocker(&self, id: ContractId, tx: TransactionId) -> Option<TransactionId> {
        let row = self.rows.get(&id)?;
        [row.xmin, row.xmax]
            .into_iter()
            .flatten()
            .find(|owner| *owner != tx)
    }

    /// Adds a pending row for `tx`. The caller has already waited out any
    /// blocker on the id.
    pub fn insert_pending(&mut self, record: ContractRecord, tx: TransactionId) -> Result<()> {
        self.validate(&record)?;
        if self.rows.contains_key(&record.id) {
            return Err(self.duplicate(record.id));
        }
        self.rows.insert(record.id, MvccRow { record, xmin: Some(tx), xmax: None });
        Ok(())
    }

    pub fn mark_deleted(&mut self, id: ContractId, tx: TransactionId) -> bool {
        match self.rows.get_mut(&id) {
            Some(row) if row.xmax.is_none() => {
                row.xmax = Some(tx);
                true
            }
            _ => false,
        }
    }

    pub fn commit_insert(&mut self, id: ContractId, tx: TransactionId) {
        if let Some(row) = self.rows.get_mut(&id)
            && row.xmin == Some(tx)
        {
            row.xmin = None;
        }
    }

    pub fn commit_delete(&mut self, id: ContractId, tx: TransactionId) {
        if self.rows.get(&id).is_some_and(|row| row.xmax == Some(tx)) {
            self.rows.remove(&id);
        }
    }

    pub fn undo_insert(&mut self, id: ContractId, tx: TransactionId) {
        if self.rows.get(&id).is_some_and(|row| row.xmin == Some(tx)) {
            self.rows.remove(&id);
        }
    }

    pub fn undo_delete(&mut self, id: ContractId, tx: TransactionId) {
        if let Some(row) = self.rows.get_mut(&id)
            && row.xmax == Some(tx)
        {
            row.xmax = None;
        }
    }

    /// Rows currently claimed by an open transaction.
    pub fn locked_rows(&self) -> usize {
        self.rows.values().filter(|row| row.is_locked()).count()
    }

    fn validate(&self, record: &ContractRecord) -> Result<()> {
        for constraint in &self.checks {
            if !(constraint.check)(record) {
                return Err(MigrationError::Constraint(format!(
                    "row {} violates check constraint \"{}\" on {}",
                    record.id, constraint.name, self.id
                )));
            }
        }
        Ok(())
    }

    fn duplicate(&self, id: ContractId) -> MigrationError {
        MigrationError::UniqueViolation(format!("key (id)=({}) already exists in {}", id, self.id))
    }
}
