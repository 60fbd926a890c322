use crate::backup::{BackupGate, DisabledBackup, MemorySnapshotBackup, PgDumpBackup, PgDumpTarget, PgDumpWriter};
use crate::config::MigratorConfig;
use crate::core::{ContractId, Registry, Result, Stage};
use crate::lifecycle::engine::PlannedTransition;
use crate::lifecycle::{RegistryReport, RunReport, TransitionEngine};
use crate::storage::{MemoryStageStore, PgStageStore, StageStore};
use chrono::{Local, NaiveDate, NaiveDateTime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub force_backup: bool,
    pub skip_backup: bool,
    /// Run as if it were this date. Defaults to the local date.
    pub today: Option<NaiveDate>,
}

/// The scheduled entry point: snapshot, then every registry's passes.
pub struct Migrator {
    store: Arc<dyn StageStore>,
    backup: Arc<dyn BackupGate>,
    engine: TransitionEngine,
    registries: Vec<Registry>,
    stalled_statement_age: Option<Duration>,
}

impl Migrator {
    pub fn new(store: Arc<dyn StageStore>, backup: Arc<dyn BackupGate>, config: &MigratorConfig) -> Self {
        Self {
            engine: TransitionEngine::new(store.clone(), config.engine_settings()),
            store,
            backup,
            registries: config.registries.clone(),
            stalled_statement_age: config.stalled_statement_age(),
        }
    }

    /// PostgreSQL store with `pg_dump` snapshots.
    pub async fn connect(config: &MigratorConfig) -> Result<Self> {
        let store = PgStageStore::connect(&config.database_url)
            .await?
            .with_lock_timeout(config.lock_wait_timeout());
        let store = Arc::new(store);
        let backup: Arc<dyn BackupGate> = if config.backup.enabled {
            let writer = PgDumpWriter::new(PgDumpTarget::from_url(&config.database_url)?)
                .program(config.backup.pg_dump.clone())
                .timeout(config.backup_timeout());
            Arc::new(PgDumpBackup::pg_dump(
                writer,
                config.backup.dir.clone(),
                &config.backup.prefix,
                config.snapshot_schedule(),
            ))
        } else {
            Arc::new(DisabledBackup)
        };
        Ok(Self::new(store, backup, config))
    }

    /// In-memory store with MessagePack snapshots.
    pub fn in_memory(store: MemoryStageStore, config: &MigratorConfig) -> Self {
        let backup: Arc<dyn BackupGate> = if config.backup.enabled {
            Arc::new(MemorySnapshotBackup::memory(
                store.clone(),
                config.backup.dir.clone(),
                &config.backup.prefix,
                config.snapshot_schedule(),
            ))
        } else {
            Arc::new(DisabledBackup)
        };
        Self::new(Arc::new(store), backup, config)
    }

    pub fn store(&self) -> &Arc<dyn StageStore> {
        &self.store
    }

    pub fn registries(&self) -> &[Registry] {
        &self.registries
    }

    /// Runs the whole migration. Never fails: the outcome, including any
    /// fatal error and the counters gathered before it, is in the report.
    pub async fn run(&mut self, options: RunOptions) -> RunReport {
        let run_id = Uuid::new_v4();
        let now = Local::now().naive_local();
        let today = options.today.unwrap_or(now.date());
        let now = today.and_time(now.time());

        let span = info_span!("run", %run_id, %today);
        self.execute(run_id, today, now, options)
            .instrument(span)
            .await
    }

    async fn execute(
        &mut self,
        run_id: Uuid,
        today: NaiveDate,
        now: NaiveDateTime,
        options: RunOptions,
    ) -> RunReport {
        let mut report = RunReport::new(run_id, today);
        info!(registries = ?self.registries, "migration run started");

        if options.skip_backup {
            info!("backup skipped");
        } else {
            match self.backup.maybe_snapshot(options.force_backup, now).await {
                Ok(path) => report.backup_path = path,
                Err(err) => {
                    warn!(error = %err, "backup failed, continuing without snapshot");
                    report.warnings.push(err.to_string());
                }
            }
        }

        if let Err(err) = self.store.ping().await {
            error!(error = %err, "store unreachable");
            report.fail(err.to_string());
            report.finish();
            return report;
        }

        if let Some(age) = self.stalled_statement_age {
            match self.store.reap_stalled_statements(age).await {
                Ok(0) => {}
                Ok(reaped) => warn!(reaped, "terminated stalled migration statements"),
                Err(err) => {
                    warn!(error = %err, "could not reap stalled statements");
                    report.warnings.push(err.to_string());
                }
            }
        }

        for registry in self.registries.clone() {
            let mut registry_report = RegistryReport::new(registry);
            let outcome = self.engine.run_registry(registry, today, &mut registry_report).await;
            report.registries.push(registry_report);

            match outcome {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    error!(%registry, error = %err, "run aborted");
                    report.fail(err.to_string());
                    break;
                }
                Err(err) => {
                    error!(%registry, error = %err, "registry failed");
                    report.fail(format!("{}: {}", registry, err));
                }
            }
        }

        report.finish();
        info!(
            success = report.success,
            migrated = report.migrated(),
            deleted = report.deleted(),
            "migration run finished"
        );
        report
    }

    /// Candidate counts per pass, without writing.
    pub async fn plan(&self, today: NaiveDate) -> Result<Vec<PlannedTransition>> {
        let mut planned = Vec::new();
        for &registry in &self.registries {
            planned.extend(self.engine.dry_run(registry, today).await?);
        }
        Ok(planned)
    }

    pub async fn backup(&self, force: bool) -> Result<Option<PathBuf>> {
        self.backup
            .maybe_snapshot(force, Local::now().naive_local())
            .await
    }

    pub async fn locate(&self, registry: Registry, id: ContractId) -> Result<Option<Stage>> {
        self.store.locate(registry, id).await
    }
}
