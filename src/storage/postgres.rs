//! PostgreSQL stage store.
//!
//! Two sessions: one for reads between transactions (candidate selection,
//! lock counts) and one owned by whichever sub-batch transaction is open.
//! Table names come only from [`TableId::name`]; every value is a bound
//! parameter.

use super::stage_store::{StageStore, StageTransaction};
use crate::core::{ContractId, MigrationError, Registry, Result, Stage, TableId};
use crate::lifecycle::Predicate;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

/// Maps a driver error onto the engine's error kinds.
pub fn classify(err: tokio_postgres::Error, context: &str) -> MigrationError {
    if err.is_closed() {
        return MigrationError::Connectivity(format!("{}: {}", context, err));
    }
    let Some(db) = err.as_db_error() else {
        let io = std::error::Error::source(&err).is_some_and(|source| source.is::<std::io::Error>());
        return if io {
            MigrationError::Connectivity(format!("{}: {}", context, err))
        } else {
            MigrationError::Store(format!("{}: {}", context, err))
        };
    };

    let message = format!("{}: {}", context, db.message());
    let code = db.code();
    if *code == SqlState::UNIQUE_VIOLATION {
        MigrationError::UniqueViolation(message)
    } else if *code == SqlState::FOREIGN_KEY_VIOLATION {
        MigrationError::ForeignKey(message)
    } else if *code == SqlState::QUERY_CANCELED {
        MigrationError::StatementTimeout(message)
    } else if *code == SqlState::LOCK_NOT_AVAILABLE {
        MigrationError::LockTimeout(message)
    } else if code.code().starts_with("23") {
        MigrationError::Constraint(message)
    } else if code.code().starts_with("08") || code.code().starts_with("57P") {
        MigrationError::Connectivity(message)
    } else {
        MigrationError::Store(message)
    }
}

/// Sessions opened by the migrator carry this `application_name`, which is
/// what [`StageStore::reap_stalled_statements`] matches on.
pub const APPLICATION_NAME: &str = "tender-migrate";

async fn connect_client(database_url: &str, role: &'static str) -> Result<Client> {
    let mut config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e| MigrationError::Config(format!("invalid database url: {}", e)))?;
    config.application_name(APPLICATION_NAME);

    let (client, connection) = config
        .connect(NoTls)
        .await
        .map_err(|e| classify(e, "connect"))?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(role, error = %err, "postgres connection closed");
        }
    });

    Ok(client)
}

/// Binds `$n` placeholders in order of use.
struct Params<'a> {
    values: Vec<&'a (dyn ToSql + Sync)>,
}

impl<'a> Params<'a> {
    fn new() -> Self {
        Self { values: Vec::new() }
    }

    fn bind(&mut self, value: &'a (dyn ToSql + Sync)) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    /// Renders `predicate`, binding `today` only if it is referenced.
    fn predicate(&mut self, predicate: &Predicate, today: &'a NaiveDate) -> String {
        let placeholder = if predicate.uses_today() {
            self.bind(today)
        } else {
            String::new()
        };
        predicate.sql(&placeholder)
    }

    fn as_slice(&self) -> &[&'a (dyn ToSql + Sync)] {
        &self.values
    }
}

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PgStageStore {
    reader: Arc<Mutex<Client>>,
    writer: Arc<Mutex<Client>>,
    lock_timeout: Duration,
}

impl PgStageStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let reader = connect_client(database_url, "reader").await?;
        let writer = connect_client(database_url, "writer").await?;
        Ok(Self::from_clients(reader, writer))
    }

    pub fn from_clients(reader: Client, writer: Client) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Longest a migration statement waits for a row lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    async fn table_exists(&self, table: TableId) -> Result<bool> {
        let client = self.reader.lock().await;
        let row = client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&table.name()])
            .await
            .map_err(|e| classify(e, "table lookup"))?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl StageStore for PgStageStore {
    async fn ping(&self) -> Result<()> {
        let client = self.reader.lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| classify(e, "ping"))?;
        Ok(())
    }

    async fn ensure_stage_tables(&self, registry: Registry) -> Result<Vec<TableId>> {
        let base = TableId::base(registry);
        if !self.table_exists(base).await? {
            return Err(MigrationError::Store(format!(
                "base table {} does not exist",
                base
            )));
        }

        let mut created = Vec::new();
        for table in TableId::all(registry).filter(|t| *t != base) {
            if self.table_exists(table).await? {
                continue;
            }
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL)",
                table.name(),
                base.name()
            );
            let client = self.reader.lock().await;
            client
                .batch_execute(&ddl)
                .await
                .map_err(|e| classify(e, "create stage table"))?;
            created.push(table);
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
        let mut params = Params::new();
        let condition = params.predicate(predicate, &today);
        let cursor = match &after {
            Some(after) => format!(" AND id > {}", params.bind(after)),
            None => String::new(),
        };
        let sql = format!(
            "SELECT id FROM {} WHERE ({}){} ORDER BY id LIMIT {}",
            table.name(),
            condition,
            cursor,
            limit
        );

        let client = self.reader.lock().await;
        let rows = client
            .query(sql.as_str(), params.as_slice())
            .await
            .map_err(|e| classify(e, "select candidates"))?;
        Ok(rows.iter().map(|row| row.get::<_, i64>(0)).collect())
    }

    async fn count_candidates(
        &self,
        table: TableId,
        predicate: &Predicate,
        today: NaiveDate,
    ) -> Result<u64> {
        let mut params = Params::new();
        let condition = params.predicate(predicate, &today);
        let sql = format!("SELECT count(*) FROM {} WHERE {}", table.name(), condition);

        let client = self.reader.lock().await;
        let row = client
            .query_one(sql.as_str(), params.as_slice())
            .await
            .map_err(|e| classify(e, "count candidates"))?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    async fn lock_count(&self, table: TableId) -> Result<u64> {
        let client = self.reader.lock().await;
        let row = client
            .query_one(
                "SELECT count(*) FROM pg_locks WHERE relation = $1::text::regclass",
                &[&table.name()],
            )
            .await
            .map_err(|e| classify(e, "lock count"))?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    async fn begin(&self, statement_timeout: Duration) -> Result<Box<dyn StageTransaction>> {
        let client = self.writer.clone().lock_owned().await;
        client
            .batch_execute(&format!(
                "BEGIN; SET LOCAL statement_timeout = {}; SET LOCAL lock_timeout = {}",
                statement_timeout.as_millis().max(1),
                self.lock_timeout.as_millis().max(1)
            ))
            .await
            .map_err(|e| classify(e, "begin"))?;
        Ok(Box::new(PgTransaction { client: Some(client) }))
    }

    async fn list_ids(&self, table: TableId) -> Result<Vec<ContractId>> {
        let sql = format!("SELECT id FROM {} ORDER BY id", table.name());
        let client = self.reader.lock().await;
        let rows = client
            .query(sql.as_str(), &[])
            .await
            .map_err(|e| classify(e, "list ids"))?;
        Ok(rows.iter().map(|row| row.get::<_, i64>(0)).collect())
    }

    async fn locate(&self, registry: Registry, id: ContractId) -> Result<Option<Stage>> {
        for table in TableId::all(registry) {
            let sql = format!("SELECT 1 FROM {} WHERE id = $1", table.name());
            let client = self.reader.lock().await;
            match client.query_opt(sql.as_str(), &[&id]).await {
                Ok(Some(_)) => return Ok(Some(table.stage())),
                Ok(None) => {}
                Err(err) if err.code() == Some(&SqlState::UNDEFINED_TABLE) => {}
                Err(err) => return Err(classify(err, "locate")),
            }
        }
        Ok(None)
    }

    async fn reap_stalled_statements(&self, older_than: Duration) -> Result<u64> {
        let client = self.reader.lock().await;
        let rows = client
            .query(
                "SELECT pid, pg_terminate_backend(pid) \
                 FROM pg_stat_activity \
                 WHERE pid <> pg_backend_pid() \
                   AND application_name = $2 \
                   AND state = 'active' \
                   AND (query ILIKE 'INSERT INTO reestr_contract_%' \
                        OR query ILIKE 'DELETE FROM reestr_contract_%') \
                   AND now() - query_start > make_interval(secs => $1)",
                &[&older_than.as_secs_f64(), &APPLICATION_NAME],
            )
            .await
            .map_err(|e| classify(e, "reap stalled statements"))?;

        let mut reaped = 0;
        for row in &rows {
            let pid: i32 = row.get(0);
            if row.get::<_, bool>(1) {
                tracing::warn!(pid, "terminated stalled migration statement");
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

pub struct PgTransaction {
    /// `None` once committed or rolled back.
    client: Option<OwnedMutexGuard<Client>>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_deref()
            .ok_or_else(|| MigrationError::Invariant("transaction already finished".into()))
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| MigrationError::Invariant("transaction already finished".into()))?;
        client
            .batch_execute(statement)
            .await
            .map_err(|e| classify(e, statement))
    }
}

#[async_trait]
impl StageTransaction for PgTransaction {
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

        let mut params = Params::new();
        let id_placeholder = params.bind(&id);
        let condition = params.predicate(predicate, &today);
        let sql = format!(
            "INSERT INTO {} SELECT * FROM {} WHERE id = {} AND ({})",
            target.name(),
            source.name(),
            id_placeholder,
            condition
        );

        let client = self.client()?;
        client
            .batch_execute("SAVEPOINT copy_row")
            .await
            .map_err(|e| classify(e, "savepoint"))?;

        match client.execute(sql.as_str(), params.as_slice()).await {
            Ok(inserted) => {
                client
                    .batch_execute("RELEASE SAVEPOINT copy_row")
                    .await
                    .map_err(|e| classify(e, "release savepoint"))?;
                Ok(inserted)
            }
            Err(err) => {
                let err = classify(err, "copy row");
                if err.is_fatal() {
                    return Err(err);
                }
                client
                    .batch_execute("ROLLBACK TO SAVEPOINT copy_row")
                    .await
                    .map_err(|e| classify(e, "rollback to savepoint"))?;

                // Stage tables inherit every unique index of the base table.
                // Only a collision on the id means the row is already there.
                match err {
                    MigrationError::UniqueViolation(detail) => {
                        let present = format!("SELECT 1 FROM {} WHERE id = $1", target.name());
                        let found = client
                            .query_opt(present.as_str(), &[&id])
                            .await
                            .map_err(|e| classify(e, "confirm duplicate"))?;
                        if found.is_some() {
                            Err(MigrationError::UniqueViolation(detail))
                        } else {
                            Err(MigrationError::Constraint(detail))
                        }
                    }
                    err => Err(err),
                }
            }
        }
    }

    async fn delete_rows(&mut self, table: TableId, ids: &[ContractId]) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE id = ANY($1)", table.name());
        self.client()?
            .execute(sql.as_str(), &[&ids])
            .await
            .map_err(|e| classify(e, "delete rows"))
    }

    async fn relax_integrity(&mut self) -> Result<()> {
        self.client()?
            .batch_execute("SET LOCAL session_replication_role = replica")
            .await
            .map_err(|e| classify(e, "relax integrity"))
    }

    async fn restore_integrity(&mut self) -> Result<()> {
        self.client()?
            .batch_execute("SET LOCAL session_replication_role = origin")
            .await
            .map_err(|e| classify(e, "restore integrity"))
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = client.batch_execute("ROLLBACK").await {
                        tracing::warn!(error = %err, "rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => tracing::warn!("transaction dropped outside a runtime; session left open"),
        }
    }
}
