//! Scoped suspension of referential checks around a source-row delete.
//!
//! The source row has already been copied when it is deleted, so the
//! contract still exists in its registry and document links must survive.
//! Checks come back on before the transaction commits, whether or not the
//! delete succeeded.

use crate::core::{ContractId, Result, TableId};
use crate::storage::StageTransaction;

#[must_use = "integrity must be restored with `release`"]
pub struct IntegrityRelaxation {
    released: bool,
}

impl IntegrityRelaxation {
    pub async fn acquire(tx: &mut dyn StageTransaction) -> Result<Self> {
        tx.relax_integrity().await?;
        Ok(Self { released: false })
    }

    pub async fn release(mut self, tx: &mut dyn StageTransaction) -> Result<()> {
        self.released = true;
        tx.restore_integrity().await
    }

    /// Deletes `ids` from `table` with checks relaxed for the statement only.
    pub async fn delete_relaxed(
        tx: &mut dyn StageTransaction,
        table: TableId,
        ids: &[ContractId],
    ) -> Result<u64> {
        let relaxation = Self::acquire(tx).await?;
        let deleted = tx.delete_rows(table, ids).await;
        let restored = relaxation.release(tx).await;
        let deleted = deleted?;
        restored?;
        Ok(deleted)
    }
}

impl Drop for IntegrityRelaxation {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!("integrity relaxation dropped before release; transaction must not commit");
        }
    }
}
