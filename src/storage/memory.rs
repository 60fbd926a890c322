// ============================================================================
// In-memory stage store
// ============================================================================
//
// Row-versioned tables behind one mutex. Writers tag row versions with their
// transaction id; a writer that collides with another open transaction on
// the same id waits for that transaction to end, then retries.
//
// Document links hang off contract ids with a configurable referential
// action, so deleting a source row without relaxing integrity either fails
// (RESTRICT) or destroys the links (CASCADE).
//
// ============================================================================

use super::snapshot::{MemorySnapshot, SnapshotFile};
use super::stage_store::{StageStore, StageTransaction};
use super::table::{CheckFn, StageTable};
use crate::core::{
    ContractId, ContractRecord, DocumentLink, MigrationError, Registry, Result, Stage, TableId,
};
use crate::lifecycle::Predicate;
use crate::transaction::{Change, Transaction, TransactionId, TransactionIds};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// What happens to document links when their contract row is deleted with
/// integrity enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    #[default]
    Restrict,
    Cascade,
}

#[derive(Debug, Clone)]
struct LinkRow {
    link: DocumentLink,
    xmax: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct Faults {
    disconnect_after: Option<usize>,
    slow_copies: HashMap<ContractId, Duration>,
    lock_count_unavailable: bool,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<TableId, StageTable>,
    links: BTreeMap<u64, LinkRow>,
    next_link_id: u64,
    transactions: HashMap<TransactionId, Transaction>,
    faults: Faults,
}

impl Inner {
    fn table(&self, id: TableId) -> Result<&StageTable> {
        self.tables
            .get(&id)
            .ok_or_else(|| MigrationError::Store(format!("relation \"{}\" does not exist", id)))
    }

    fn table_mut(&mut self, id: TableId) -> Result<&mut StageTable> {
        self.tables
            .get_mut(&id)
            .ok_or_else(|| MigrationError::Store(format!("relation \"{}\" does not exist", id)))
    }

    fn transaction(&mut self, id: TransactionId) -> Result<&mut Transaction> {
        self.transactions
            .get_mut(&id)
            .ok_or_else(|| MigrationError::Invariant(format!("transaction {} is not open", id)))
    }

    fn table_or_create(&mut self, id: TableId) -> &mut StageTable {
        self.tables.entry(id).or_insert_with(|| StageTable::new(id))
    }

    /// Applies or discards every change of `tx`. Returns whether the
    /// transaction was still open.
    fn finish(&mut self, tx: TransactionId, commit: bool) -> Result<bool> {
        let Some(mut transaction) = self.transactions.remove(&tx) else {
            return Ok(false);
        };
        let changes = if commit {
            transaction.commit()?
        } else {
            transaction.rollback()?
        };
        tracing::trace!(
            %tx,
            commit,
            changes = changes.len(),
            elapsed_ms = transaction.duration().as_millis() as u64,
            "transaction finished"
        );
        for change in changes {
            match change {
                Change::InsertRow { table, id } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        if commit {
                            t.commit_insert(id, tx);
                        } else {
                            t.undo_insert(id, tx);
                        }
                    }
                }
                Change::DeleteRow { table, id } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        if commit {
                            t.commit_delete(id, tx);
                        } else {
                            t.undo_delete(id, tx);
                        }
                    }
                }
                Change::DeleteLink { link_id } => {
                    if commit {
                        self.links.remove(&link_id);
                    } else if let Some(row) = self.links.get_mut(&link_id) {
                        row.xmax = None;
                    }
                }
            }
        }
        Ok(true)
    }
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled whenever a transaction ends.
    released: Notify,
    online: AtomicBool,
    ids: TransactionIds,
    lock_wait_timeout: Duration,
    referential_action: ReferentialAction,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        Ok(self.inner.lock()?)
    }

    /// Locks the state for one statement, failing if the store is offline or
    /// an injected disconnect has come due.
    fn statement(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock()?;
        if !self.online.load(Ordering::SeqCst) {
            return Err(MigrationError::Connectivity("in-memory store is offline".into()));
        }
        match inner.faults.disconnect_after {
            Some(0) => {
                self.online.store(false, Ordering::SeqCst);
                inner.faults.disconnect_after = None;
                return Err(MigrationError::Connectivity(
                    "in-memory store connection lost".into(),
                ));
            }
            Some(remaining) => inner.faults.disconnect_after = Some(remaining - 1),
            None => {}
        }
        Ok(inner)
    }

    fn end(&self, tx: TransactionId, commit: bool) -> Result<()> {
        let result = self.lock().and_then(|mut inner| inner.finish(tx, commit));
        self.released.notify_waiters();
        result.map(|_| ())
    }
}

enum Attempt<T> {
    Done(T),
    Blocked(TransactionId),
}

/// Transactional in-process [`StageStore`].
///
/// Cloning yields another handle onto the same data.
#[derive(Clone)]
pub struct MemoryStageStore {
    shared: Arc<Shared>,
}

impl MemoryStageStore {
    /// A store holding only the two registries' base tables.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MemoryStageStoreBuilder {
        MemoryStageStoreBuilder::default()
    }

    /// Rebuilds a store from a snapshot written by [`MemoryStageStore::save`].
    pub fn restore<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().restore(path)
    }

    fn load_snapshot<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let snapshot = SnapshotFile::new(path).load()?;
        {
            let mut inner = self.shared.lock()?;
            for (name, records) in snapshot.tables {
                let table = table_by_name(&name)?;
                let target = inner.table_or_create(table);
                for record in records {
                    target.seed(record)?;
                }
            }
            for link in snapshot.links {
                inner.next_link_id = inner.next_link_id.max(link.id);
                inner.links.insert(link.id, LinkRow { link, xmax: None });
            }
        }
        Ok(self)
    }

    pub fn snapshot(&self) -> Result<MemorySnapshot> {
        let inner = self.shared.lock()?;
        let tables = inner
            .tables
            .iter()
            .map(|(id, table)| (id.name().to_string(), table.committed().cloned().collect()))
            .collect();
        let links = inner
            .links
            .values()
            .map(|row| row.link.clone())
            .collect();
        Ok(MemorySnapshot::new(tables, links))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let snapshot = self.snapshot()?;
        SnapshotFile::new(path).save(&snapshot)?;
        Ok(snapshot.row_count())
    }

    /// Inserts a committed row, creating the table if needed. Stands in for
    /// the ingestion pipeline.
    pub fn seed(&self, table: TableId, record: ContractRecord) -> Result<()> {
        self.shared.lock()?.table_or_create(table).seed(record)
    }

    pub fn seed_many(&self, table: TableId, records: impl IntoIterator<Item = ContractRecord>) -> Result<()> {
        let mut inner = self.shared.lock()?;
        let target = inner.table_or_create(table);
        for record in records {
            target.seed(record)?;
        }
        Ok(())
    }

    pub fn add_check(&self, table: TableId, name: &str, check: CheckFn) -> Result<()> {
        self.shared.lock()?.table_or_create(table).add_check(name, check);
        Ok(())
    }

    /// Committed row for `id` in `table`.
    pub fn get(&self, table: TableId, id: ContractId) -> Result<Option<ContractRecord>> {
        let inner = self.shared.lock()?;
        Ok(inner
            .tables
            .get(&table)
            .and_then(|t| t.visible(id, None))
            .cloned())
    }

    pub fn row_count(&self, table: TableId) -> Result<usize> {
        let inner = self.shared.lock()?;
        Ok(inner.tables.get(&table).map_or(0, StageTable::committed_len))
    }

    pub fn has_table(&self, table: TableId) -> Result<bool> {
        Ok(self.shared.lock()?.tables.contains_key(&table))
    }

    // ------------------------------------------------------------------------
    // Document links
    // ------------------------------------------------------------------------

    pub fn add_link(&self, registry: Registry, contract_id: ContractId, url: &str) -> Result<u64> {
        let mut inner = self.shared.lock()?;
        inner.next_link_id += 1;
        let id = inner.next_link_id;
        let link = DocumentLink {
            id,
            registry,
            contract_id,
            url: url.to_string(),
        };
        inner.links.insert(id, LinkRow { link, xmax: None });
        Ok(id)
    }

    pub fn links_for(&self, registry: Registry, contract_id: ContractId) -> Result<Vec<DocumentLink>> {
        let inner = self.shared.lock()?;
        Ok(inner
            .links
            .values()
            .filter(|row| row.link.registry == registry && row.link.contract_id == contract_id)
            .map(|row| row.link.clone())
            .collect())
    }

    pub fn link_count(&self) -> Result<usize> {
        Ok(self.shared.lock()?.links.len())
    }

    /// Follows a link to the contract row it names, wherever it lives now.
    pub fn resolve_link(&self, link_id: u64) -> Result<Option<(Stage, ContractRecord)>> {
        let inner = self.shared.lock()?;
        let Some(row) = inner.links.get(&link_id) else {
            return Ok(None);
        };
        let link = &row.link;
        Ok(TableId::all(link.registry).find_map(|table| {
            inner
                .tables
                .get(&table)
                .and_then(|t| t.visible(link.contract_id, None))
                .map(|record| (table.stage(), record.clone()))
        }))
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    pub fn go_offline(&self) {
        self.shared.online.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.shared.online.store(true, Ordering::SeqCst);
    }

    /// Lets `statements` more statements succeed, then drops the connection.
    pub fn disconnect_after(&self, statements: usize) -> Result<()> {
        self.shared.lock()?.faults.disconnect_after = Some(statements);
        Ok(())
    }

    /// Makes every copy of `id` take at least `delay`.
    pub fn slow_copy(&self, id: ContractId, delay: Duration) -> Result<()> {
        self.shared.lock()?.faults.slow_copies.insert(id, delay);
        Ok(())
    }

    pub fn fail_lock_counts(&self, fail: bool) -> Result<()> {
        self.shared.lock()?.faults.lock_count_unavailable = fail;
        Ok(())
    }

    pub fn open_transactions(&self) -> Result<usize> {
        Ok(self.shared.lock()?.transactions.len())
    }

    /// Runs `attempt` under the state lock until it is not blocked by another
    /// transaction, waiting for transactions to end in between.
    ///
    /// The wait is bounded by the lock wait timeout or by the statement
    /// timeout of `tx`, whichever is shorter.
    async fn until_unblocked<T, F>(&self, tx: TransactionId, what: &str, mut attempt: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut Inner) -> Result<Attempt<T>> + Send,
    {
        let statement_timeout = self.shared.lock()?.transaction(tx)?.statement_timeout();
        let lock_wait_timeout = self.shared.lock_wait_timeout;
        let deadline = Instant::now() + statement_timeout.min(lock_wait_timeout);
        loop {
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let blocker = {
                let mut inner = self.shared.statement()?;
                match attempt(&mut *inner)? {
                    Attempt::Done(value) => return Ok(value),
                    Attempt::Blocked(blocker) => blocker,
                }
            };

            tracing::debug!(%blocker, what, "waiting for row lock");
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(if statement_timeout < lock_wait_timeout {
                    MigrationError::StatementTimeout(format!(
                        "{}: canceled after {:?} waiting for {}",
                        what, statement_timeout, blocker
                    ))
                } else {
                    MigrationError::LockTimeout(format!(
                        "{}: gave up waiting for {} after {:?}",
                        what, blocker, lock_wait_timeout
                    ))
                });
            }
        }
    }
}

impl Default for MemoryStageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStageStoreBuilder {
    lock_wait_timeout: Duration,
    referential_action: ReferentialAction,
    all_tables: bool,
}

impl Default for MemoryStageStoreBuilder {
    fn default() -> Self {
        Self {
            lock_wait_timeout: DEFAULT_LOCK_WAIT_TIMEOUT,
            referential_action: ReferentialAction::default(),
            all_tables: false,
        }
    }
}

impl MemoryStageStoreBuilder {
    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn referential_action(mut self, action: ReferentialAction) -> Self {
        self.referential_action = action;
        self
    }

    /// Create every stage table up front instead of only the base tables.
    pub fn with_all_tables(mut self) -> Self {
        self.all_tables = true;
        self
    }

    /// Builds the store and fills it from a snapshot file.
    pub fn restore<P: AsRef<Path>>(self, path: P) -> Result<MemoryStageStore> {
        self.build().load_snapshot(path)
    }

    pub fn build(self) -> MemoryStageStore {
        let mut inner = Inner::default();
        for registry in Registry::ALL {
            inner.table_or_create(TableId::base(registry));
            if self.all_tables {
                for table in TableId::all(registry) {
                    inner.table_or_create(table);
                }
            }
        }
        MemoryStageStore {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                released: Notify::new(),
                online: AtomicBool::new(true),
                ids: TransactionIds::new(),
                lock_wait_timeout: self.lock_wait_timeout,
                referential_action: self.referential_action,
            }),
        }
    }
}

fn table_by_name(name: &str) -> Result<TableId> {
    Registry::ALL
        .into_iter()
        .flat_map(TableId::all)
        .find(|table| table.name() == name)
        .ok_or_else(|| MigrationError::Serialization(format!("unknown table '{}' in snapshot", name)))
}

#[async_trait]
impl StageStore for MemoryStageStore {
    async fn ping(&self) -> Result<()> {
        self.shared.statement().map(|_| ())
    }

    async fn ensure_stage_tables(&self, registry: Registry) -> Result<Vec<TableId>> {
        let mut inner = self.shared.statement()?;
        let base = TableId::base(registry);
        inner.table(base)?;

        let mut created = Vec::new();
        for table in TableId::all(registry) {
            if !inner.tables.contains_key(&table) {
                inner.tables.insert(table, StageTable::new(table));
                created.push(table);
            }
        }
        Ok(created)
    }

    async fn select_candidate_ids(
        &self,
        table: TableId,
        predicate: &Predicate,
        today: NaiveDate,
        after: Option<ContractId>,
        limit: usize,
    ) -> Result<Vec<ContractId>> {
        let inner = self.shared.statement()?;
        Ok(inner
            .table(table)?
            .committed()
            .filter(|record| after.is_none_or(|cursor| record.id > cursor))
            .filter(|record| predicate.matches(record, today))
            .map(|record| record.id)
            .take(limit)
            .collect())
    }

    async fn count_candidates(
        &self,
        table: TableId,
        predicate: &Predicate,
        today: NaiveDate,
    ) -> Result<u64> {
        let inner = self.shared.statement()?;
        Ok(inner
            .table(table)?
            .committed()
            .filter(|record| predicate.matches(record, today))
            .count() as u64)
    }

    async fn lock_count(&self, table: TableId) -> Result<u64> {
        let inner = self.shared.statement()?;
        if inner.faults.lock_count_unavailable {
            return Err(MigrationError::Store("lock statistics unavailable".into()));
        }
        Ok(inner.tables.get(&table).map_or(0, StageTable::locked_rows) as u64)
    }

    async fn begin(&self, statement_timeout: Duration) -> Result<Box<dyn StageTransaction>> {
        let mut inner = self.shared.statement()?;
        let id = self.shared.ids.next();
        inner.transactions.insert(id, Transaction::new(id, statement_timeout));
        tracing::trace!(%id, "begin");
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            id,
            open: true,
        }))
    }

    async fn list_ids(&self, table: TableId) -> Result<Vec<ContractId>> {
        let inner = self.shared.statement()?;
        Ok(inner.table(table)?.committed().map(|record| record.id).collect())
    }

    async fn locate(&self, registry: Registry, id: ContractId) -> Result<Option<Stage>> {
        let inner = self.shared.statement()?;
        Ok(TableId::all(registry)
            .find(|table| {
                inner
                    .tables
                    .get(table)
                    .is_some_and(|t| t.visible(id, None).is_some())
            })
            .map(|table| table.stage()))
    }
}

/// An open transaction on a [`MemoryStageStore`].
pub struct MemoryTransaction {
    store: MemoryStageStore,
    id: TransactionId,
    open: bool,
}

impl MemoryTransaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        self.open = false;
        self.store.shared.end(self.id, commit)
    }
}

#[async_trait]
impl StageTransaction for MemoryTransaction {
    async fn insert_copy(
        &mut self,
        registry: Registry,
        from: Stage,
        to: Stage,
        id: ContractId,
        predicate: &Predicate,
        today: NaiveDate,
    ) -> Result<u64> {
        let source = TableId::new(registry, from)?;
        let target = TableId::new(registry, to)?;
        let tx = self.id;

        let delay = self.store.shared.lock()?.faults.slow_copies.get(&id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // The source row is read once, as of the first attempt, so a retry
        // after waiting still collides with the row the blocker committed.
        let mut source_row: Option<Option<ContractRecord>> = None;
        self.store
            .until_unblocked(tx, "copy", |inner| {
                if source_row.is_none() {
                    let visible = inner
                        .table(source)?
                        .visible(id, Some(tx))
                        .filter(|record| predicate.matches(record, today))
                        .cloned();
                    source_row = Some(visible);
                }
                let Some(record) = source_row.clone().flatten() else {
                    return Ok(Attempt::Done(0));
                };

                let table = inner.table_mut(target)?;
                if let Some(blocker) = table.blocker(id, tx) {
                    return Ok(Attempt::Blocked(blocker));
                }
                table.insert_pending(record, tx)?;
                inner.transaction(tx)?.record_change(Change::InsertRow { table: target, id })?;
                Ok(Attempt::Done(1))
            })
            .await
    }

    async fn delete_rows(&mut self, table: TableId, ids: &[ContractId]) -> Result<u64> {
        let tx = self.id;
        let action = self.store.shared.referential_action;

        self.store
            .until_unblocked(tx, "delete", |inner| {
                let relaxed = inner.transaction(tx)?.is_relaxed();

                let mut doomed = Vec::with_capacity(ids.len());
                {
                    let t = inner.table(table)?;
                    for &id in ids {
                        let Some(row) = t.row(id) else { continue };
                        match (row.xmin, row.xmax) {
                            // Another writer's uncommitted insert is invisible.
                            (Some(owner), _) if owner != tx => continue,
                            (_, Some(owner)) if owner == tx => continue,
                            (_, Some(owner)) => return Ok(Attempt::Blocked(owner)),
                            _ => doomed.push(id),
                        }
                    }
                }

                let dependents: Vec<u64> = inner
                    .links
                    .values()
                    .filter(|row| {
                        row.xmax.is_none()
                            && row.link.registry == table.registry()
                            && doomed.contains(&row.link.contract_id)
                    })
                    .map(|row| row.link.id)
                    .collect();

                if !relaxed && !dependents.is_empty() {
                    match action {
                        ReferentialAction::Restrict => {
                            return Err(MigrationError::ForeignKey(format!(
                                "delete on \"{}\" violates document link constraint ({} dependent rows)",
                                table,
                                dependents.len()
                            )));
                        }
                        ReferentialAction::Cascade => {
                            for link_id in dependents {
                                if let Some(row) = inner.links.get_mut(&link_id) {
                                    row.xmax = Some(tx);
                                }
                                inner.transaction(tx)?.record_change(Change::DeleteLink { link_id })?;
                            }
                        }
                    }
                }

                let t = inner.table_mut(table)?;
                let marked: Vec<ContractId> =
                    doomed.into_iter().filter(|&id| t.mark_deleted(id, tx)).collect();
                let transaction = inner.transaction(tx)?;
                for &id in &marked {
                    transaction.record_change(Change::DeleteRow { table, id })?;
                }
                Ok(Attempt::Done(marked.len() as u64))
            })
            .await
    }

    async fn relax_integrity(&mut self) -> Result<()> {
        self.store.shared.statement()?.transaction(self.id)?.set_relaxed(true);
        Ok(())
    }

    async fn restore_integrity(&mut self) -> Result<()> {
        self.store.shared.statement()?.transaction(self.id)?.set_relaxed(false);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if !self.store.shared.online.load(Ordering::SeqCst) {
            self.finish(false)?;
            return Err(MigrationError::Connectivity(
                "connection lost before commit".into(),
            ));
        }
        self.finish(true)
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish(false)
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.open {
            tracing::debug!(id = %self.id, "transaction dropped while open, rolling back");
            if let Err(err) = self.finish(false) {
                tracing::warn!(id = %self.id, error = %err, "rollback on drop failed");
            }
        }
    }
}
