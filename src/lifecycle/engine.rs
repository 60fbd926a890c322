use super::report::{RegistryReport, TransitionReport};
use super::transition::{DEFAULT_COMPLETION_GRACE_DAYS, Transition, TransitionPlan};
use crate::batch::{BatchCoordinator, BatchSettings};
use crate::core::{Registry, Result, Stage, TableId};
use crate::storage::StageStore;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};

pub const DEFAULT_CANDIDATE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    /// Candidate ids fetched per query.
    pub candidate_limit: usize,
    pub completion_grace_days: u32,
    pub batch: BatchSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            completion_grace_days: DEFAULT_COMPLETION_GRACE_DAYS,
            batch: BatchSettings::default(),
        }
    }
}

/// Candidate count for one transition, as reported by a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTransition {
    pub registry: Registry,
    pub from: Stage,
    pub to: Stage,
    pub predicate: String,
    pub candidates: u64,
}

/// Runs a registry's transition plan, pass by pass.
pub struct TransitionEngine {
    store: Arc<dyn StageStore>,
    coordinator: BatchCoordinator,
    settings: EngineSettings,
}

impl TransitionEngine {
    pub fn new(store: Arc<dyn StageStore>, settings: EngineSettings) -> Self {
        Self {
            coordinator: BatchCoordinator::new(store.clone(), settings.batch),
            store,
            settings,
        }
    }

    pub fn plan(&self, registry: Registry) -> Result<TransitionPlan> {
        TransitionPlan::standard(registry, self.settings.completion_grace_days)
    }

    /// Runs every pass for `registry`, accumulating into `report`.
    ///
    /// Returns early only on a fatal error; counters gathered up to that
    /// point stay in `report`.
    pub async fn run_registry(
        &mut self,
        registry: Registry,
        today: NaiveDate,
        report: &mut RegistryReport,
    ) -> Result<()> {
        let span = info_span!("registry", %registry);
        self.drive_registry(registry, today, report)
            .instrument(span)
            .await
    }

    async fn drive_registry(
        &mut self,
        registry: Registry,
        today: NaiveDate,
        report: &mut RegistryReport,
    ) -> Result<()> {
        let created = self.store.ensure_stage_tables(registry).await?;
        for table in &created {
            info!(table = %table, "created missing stage table");
        }
        report
            .tables_created
            .extend(created.iter().map(|t| t.name().to_string()));

        let plan = self.plan(registry)?;
        for transition in plan.iter() {
            let mut stats = TransitionReport::new(transition.from, transition.to);
            let outcome = self.run_transition(registry, transition, today, &mut stats).await;
            match outcome {
                Ok(()) => report.transitions.push(stats),
                Err(err) if err.is_fatal() => {
                    report.transitions.push(stats);
                    return Err(err);
                }
                Err(err) => {
                    warn!(transition = %transition.key(), error = %err, "pass abandoned");
                    stats.record_error(err.to_string());
                    report.transitions.push(stats);
                }
            }
        }
        info!(
            migrated = report.migrated(),
            deleted = report.deleted(),
            "registry done"
        );
        Ok(())
    }

    /// One pass: fetch candidates after the cursor until none remain.
    ///
    /// The cursor only moves forward, so ids that are rejected every time
    /// are visited once per run rather than fetched forever.
    pub async fn run_transition(
        &mut self,
        registry: Registry,
        transition: &Transition,
        today: NaiveDate,
        report: &mut TransitionReport,
    ) -> Result<()> {
        let span = info_span!("transition", key = %transition.key());
        self.drive_transition(registry, transition, today, report)
            .instrument(span)
            .await
    }

    async fn drive_transition(
        &mut self,
        registry: Registry,
        transition: &Transition,
        today: NaiveDate,
        report: &mut TransitionReport,
    ) -> Result<()> {
        let source = TableId::new(registry, transition.from)?;
        let limit = self.settings.candidate_limit.max(1);
        let mut cursor = None;

        loop {
            let ids = self
                .store
                .select_candidate_ids(source, &transition.predicate, today, cursor, limit)
                .await?;
            let Some(&last) = ids.last() else { break };

            info!(fetched = ids.len(), after = ?cursor, "fetched candidates");
            report.candidates += ids.len() as u64;
            self.coordinator
                .migrate(registry, transition, today, &ids, report)
                .await?;
            cursor = Some(last);
        }

        info!(
            candidates = report.candidates,
            migrated = report.migrated,
            already_present = report.already_present,
            rejected = report.rejected,
            failed_sub_batches = report.failed_sub_batches,
            "pass complete"
        );
        Ok(())
    }

    /// Counts candidates for every pass without writing.
    ///
    /// Passes are counted against the current data, so a contract that one
    /// pass would move is still counted in its current stage by later passes.
    pub async fn dry_run(&self, registry: Registry, today: NaiveDate) -> Result<Vec<PlannedTransition>> {
        let plan = self.plan(registry)?;
        let mut planned = Vec::with_capacity(plan.transitions().len());
        for transition in plan.iter() {
            let table = TableId::new(registry, transition.from)?;
            let candidates = match self
                .store
                .count_candidates(table, &transition.predicate, today)
                .await
            {
                Ok(count) => count,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(table = %table, error = %err, "cannot count candidates");
                    0
                }
            };
            planned.push(PlannedTransition {
                registry,
                from: transition.from,
                to: transition.to,
                predicate: transition.predicate.to_string(),
                candidates,
            });
        }
        Ok(planned)
    }
}
