use crate::batch::guard::{CopyOutcome, DuplicateGuard};
use crate::core::{ContractId, Registry, Result, Stage, TableId};
use crate::lifecycle::Predicate;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Duration;

/// Pluggable home of the stage tables.
///
/// Reads outside a transaction see committed rows only.
#[async_trait]
pub trait StageStore: Send + Sync {
    /// Cheap round-trip. Fails with `Connectivity` when the store is gone.
    async fn ping(&self) -> Result<()>;

    /// Creates any missing stage table for `registry` with the base table's
    /// structure. Returns the tables that were created.
    async fn ensure_stage_tables(&self, registry: Registry) -> Result<Vec<TableId>>;

    /// Ids in `table` satisfying `predicate`, ascending, strictly greater
    /// than `after`, at most `limit` of them.
    async fn select_candidate_ids(
        &self,
        table: TableId,
        predicate: &Predicate,
        today: NaiveDate,
        after: Option<ContractId>,
        limit: usize,
    ) -> Result<Vec<ContractId>>;

    async fn count_candidates(
        &self,
        table: TableId,
        predicate: &Predicate,
        today: NaiveDate,
    ) -> Result<u64>;

    /// Row locks currently held on `table` by any session.
    async fn lock_count(&self, table: TableId) -> Result<u64>;

    /// Opens a transaction whose statements are bounded by `statement_timeout`.
    async fn begin(&self, statement_timeout: Duration) -> Result<Box<dyn StageTransaction>>;

    async fn list_ids(&self, table: TableId) -> Result<Vec<ContractId>>;

    /// The stage currently holding `id`, or `None` if no committed row has it.
    async fn locate(&self, registry: Registry, id: ContractId) -> Result<Option<Stage>>;

    /// Cancels migration statements that have been running longer than
    /// `older_than`. Stores without sessions have nothing to reap.
    async fn reap_stalled_statements(&self, _older_than: Duration) -> Result<u64> {
        Ok(0)
    }
}

/// One open transaction against a [`StageStore`].
///
/// Dropping a handle without `commit` rolls it back.
#[async_trait]
pub trait StageTransaction: Send {
    /// `INSERT INTO to SELECT * FROM from WHERE id = $id AND <predicate>`.
    ///
    /// Returns the number of rows inserted. A failure must leave the
    /// transaction usable for further rows.
    async fn insert_copy(
        &mut self,
        registry: Registry,
        from: Stage,
        to: Stage,
        id: ContractId,
        predicate: &Predicate,
        today: NaiveDate,
    ) -> Result<u64>;

    async fn delete_rows(&mut self, table: TableId, ids: &[ContractId]) -> Result<u64>;

    /// Suspends referential triggers for the rest of this transaction.
    async fn relax_integrity(&mut self) -> Result<()>;

    async fn restore_integrity(&mut self) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Copies one row and classifies the result.
    async fn copy_row(
        &mut self,
        registry: Registry,
        from: Stage,
        to: Stage,
        id: ContractId,
        predicate: &Predicate,
        today: NaiveDate,
    ) -> Result<CopyOutcome> {
        let attempt = self.insert_copy(registry, from, to, id, predicate, today).await;
        DuplicateGuard::classify(id, attempt)
    }
}
