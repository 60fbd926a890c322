use super::backoff::{BackoffPolicy, Throttle};
use super::guard::CopyOutcome;
use super::integrity::IntegrityRelaxation;
use crate::core::{ContractId, MigrationError, Registry, Result, TableId};
use crate::lifecycle::{Transition, TransitionReport};
use crate::storage::{StageStore, StageTransaction};
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_SUB_BATCH_SIZE: usize = 50;
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSettings {
    pub sub_batch_size: usize,
    pub statement_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What one committed sub-batch did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct SubBatchOutcome {
    inserted: u64,
    already_present: u64,
    not_eligible: u64,
    deleted: u64,
    rejections: Vec<(ContractId, String)>,
}

/// Drives a candidate list through copy-then-delete, one transaction per
/// sub-batch.
pub struct BatchCoordinator {
    store: Arc<dyn StageStore>,
    settings: BatchSettings,
    throttle: Throttle,
}

impl BatchCoordinator {
    pub fn new(store: Arc<dyn StageStore>, settings: BatchSettings) -> Self {
        Self {
            store,
            throttle: Throttle::new(settings.backoff),
            settings,
        }
    }

    /// Processes `ids` in ascending sub-batches.
    ///
    /// A sub-batch that fails for any reason other than lost connectivity is
    /// rolled back, counted and skipped. Counters only include committed
    /// work.
    pub async fn migrate(
        &mut self,
        registry: Registry,
        transition: &Transition,
        today: NaiveDate,
        ids: &[ContractId],
        report: &mut TransitionReport,
    ) -> Result<()> {
        let target = TableId::new(registry, transition.to)?;

        for chunk in ids.chunks(self.settings.sub_batch_size.max(1)) {
            self.throttle(target, report).await?;
            report.sub_batches += 1;

            match self.run_sub_batch(registry, transition, today, chunk).await {
                Ok(outcome) => {
                    report.inserted += outcome.inserted;
                    report.already_present += outcome.already_present;
                    report.migrated += outcome.inserted + outcome.already_present;
                    report.rejected += outcome.rejections.len() as u64;
                    report.not_eligible += outcome.not_eligible;
                    report.deleted += outcome.deleted;
                    for (id, reason) in &outcome.rejections {
                        report.record_error(format!("id {} rejected: {}", id, reason));
                    }
                    debug!(
                        first = chunk[0],
                        size = chunk.len(),
                        inserted = outcome.inserted,
                        already_present = outcome.already_present,
                        deleted = outcome.deleted,
                        "sub-batch committed"
                    );
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    report.failed_sub_batches += 1;
                    if err.is_timeout() {
                        report.timed_out_sub_batches += 1;
                    }
                    report.skipped_ids += chunk.len() as u64;
                    report.record_error(format!("ids {}..={}: {}", chunk[0], chunk[chunk.len() - 1], err));
                    warn!(
                        first = chunk[0],
                        size = chunk.len(),
                        error = %err,
                        "sub-batch rolled back and skipped"
                    );
                }
            }
        }
        Ok(())
    }

    async fn throttle(&mut self, target: TableId, report: &mut TransitionReport) -> Result<()> {
        let lock_count = match self.store.lock_count(target).await {
            Ok(count) => count,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(table = %target, error = %err, "lock count unavailable, not throttling");
                0
            }
        };

        if let Some(delay) = self.throttle.assess(lock_count) {
            report.throttled += 1;
            info!(
                table = %target,
                lock_count,
                consecutive = self.throttle.consecutive(),
                delay_ms = delay.as_millis() as u64,
                "target contended, backing off"
            );
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn run_sub_batch(
        &self,
        registry: Registry,
        transition: &Transition,
        today: NaiveDate,
        ids: &[ContractId],
    ) -> Result<SubBatchOutcome> {
        let timeout = self.settings.statement_timeout;
        let mut tx = self.store.begin(timeout).await?;

        let work = Self::apply(tx.as_mut(), registry, transition, today, ids);
        let result = match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(MigrationError::StatementTimeout(format!(
                "sub-batch of {} ids exceeded {:?}",
                ids.len(),
                timeout
            ))),
        };

        match result {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                    if rollback_err.is_fatal() {
                        return Err(rollback_err);
                    }
                }
                Err(err)
            }
        }
    }

    /// Copies every id, then deletes the source rows that are confirmed in
    /// the target. Nothing is deleted unless its copy was confirmed.
    async fn apply(
        tx: &mut dyn StageTransaction,
        registry: Registry,
        transition: &Transition,
        today: NaiveDate,
        ids: &[ContractId],
    ) -> Result<SubBatchOutcome> {
        let mut outcome = SubBatchOutcome::default();
        let mut movable = Vec::with_capacity(ids.len());

        for &id in ids {
            let copied = tx
                .copy_row(registry, transition.from, transition.to, id, &transition.predicate, today)
                .await?;
            match copied {
                CopyOutcome::Inserted => outcome.inserted += 1,
                CopyOutcome::AlreadyPresent => outcome.already_present += 1,
                CopyOutcome::Rejected(ref reason) => outcome.rejections.push((id, reason.clone())),
                CopyOutcome::NotEligible => outcome.not_eligible += 1,
            }
            if copied.is_movable() {
                movable.push(id);
            }
        }

        if !movable.is_empty() {
            let source = TableId::new(registry, transition.from)?;
            outcome.deleted = IntegrityRelaxation::delete_relaxed(tx, source, &movable).await?;
        }
        Ok(outcome)
    }
}
