// ============================================================================
// Pending changes
// ============================================================================
//
// A change names a row version a transaction has touched. The version itself
// lives in the table, tagged with the owning transaction; the change list is
// how commit and rollback find it again without scanning every table.
//
// ============================================================================

use crate::core::{ContractId, TableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// A row version created by a copy
    InsertRow { table: TableId, id: ContractId },

    /// A committed row marked for deletion
    DeleteRow { table: TableId, id: ContractId },

    /// A document link removed by a cascading delete
    DeleteLink { link_id: u64 },
}

impl Change {
    pub fn table(&self) -> Option<TableId> {
        match self {
            Change::InsertRow { table, .. } | Change::DeleteRow { table, .. } => Some(*table),
            Change::DeleteLink { .. } => None,
        }
    }

    /// Row versions count as held locks until the transaction ends.
    pub fn holds_row_lock(&self) -> bool {
        !matches!(self, Change::DeleteLink { .. })
    }
}
