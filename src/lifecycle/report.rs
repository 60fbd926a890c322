use crate::core::{Registry, Stage};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Error messages kept per transition. Later ones are only counted.
const MAX_RECORDED_ERRORS: usize = 20;

/// Counters for one transition pass.
///
/// `migrated` counts ids now present in the target whose source row was
/// deleted in the same commit, including ids a previous run had already
/// copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub from: Stage,
    pub to: Stage,
    pub candidates: u64,
    pub migrated: u64,
    pub deleted: u64,
    pub inserted: u64,
    pub already_present: u64,
    pub rejected: u64,
    pub not_eligible: u64,
    pub sub_batches: u64,
    pub failed_sub_batches: u64,
    pub timed_out_sub_batches: u64,
    pub skipped_ids: u64,
    pub throttled: u64,
    pub errors: Vec<String>,
}

impl TransitionReport {
    pub fn new(from: Stage, to: Stage) -> Self {
        Self {
            from,
            to,
            candidates: 0,
            migrated: 0,
            deleted: 0,
            inserted: 0,
            already_present: 0,
            rejected: 0,
            not_eligible: 0,
            sub_batches: 0,
            failed_sub_batches: 0,
            timed_out_sub_batches: 0,
            skipped_ids: 0,
            throttled: 0,
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(message.into());
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed_sub_batches == 0 && self.rejected == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryReport {
    pub registry: Registry,
    pub tables_created: Vec<String>,
    pub transitions: Vec<TransitionReport>,
}

impl RegistryReport {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            tables_created: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn transition(&self, from: Stage, to: Stage) -> Option<&TransitionReport> {
        self.transitions.iter().find(|t| t.from == from && t.to == to)
    }

    pub fn migrated(&self) -> u64 {
        self.transitions.iter().map(|t| t.migrated).sum()
    }

    pub fn deleted(&self) -> u64 {
        self.transitions.iter().map(|t| t.deleted).sum()
    }
}

/// Result of one scheduled run. Always produced, including on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub today: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub registries: Vec<RegistryReport>,
}

impl RunReport {
    pub fn new(run_id: Uuid, today: NaiveDate) -> Self {
        Self {
            run_id,
            today,
            started_at: Utc::now(),
            finished_at: None,
            success: true,
            error: None,
            backup_path: None,
            warnings: Vec::new(),
            registries: Vec::new(),
        }
    }

    pub fn registry(&self, registry: Registry) -> Option<&RegistryReport> {
        self.registries.iter().find(|r| r.registry == registry)
    }

    pub fn transition(&self, registry: Registry, from: Stage, to: Stage) -> Option<&TransitionReport> {
        self.registry(registry)?.transition(from, to)
    }

    pub fn migrated(&self) -> u64 {
        self.registries.iter().map(RegistryReport::migrated).sum()
    }

    pub fn deleted(&self) -> u64 {
        self.registries.iter().map(RegistryReport::deleted).sum()
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_add_up_across_registries() {
        let mut run = RunReport::new(Uuid::new_v4(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        for (registry, migrated) in [(Registry::Fz44, 3), (Registry::Fz223, 4)] {
            let mut r = RegistryReport::new(registry);
            let mut t = TransitionReport::new(Stage::Active, Stage::CommissionReview);
            t.migrated = migrated;
            t.deleted = migrated;
            r.transitions.push(t);
            run.registries.push(r);
        }
        assert_eq!(run.migrated(), 7);
        assert_eq!(run.deleted(), 7);
        assert_eq!(
            run.transition(Registry::Fz223, Stage::Active, Stage::CommissionReview)
                .map(|t| t.migrated),
            Some(4)
        );
    }

    #[test]
    fn error_list_is_bounded() {
        let mut t = TransitionReport::new(Stage::Active, Stage::Bad);
        for i in 0..50 {
            t.record_error(format!("error {}", i));
        }
        assert_eq!(t.errors.len(), MAX_RECORDED_ERRORS);
    }

    #[test]
    fn failure_serializes_with_message() {
        let mut run = RunReport::new(Uuid::nil(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        run.fail("store unreachable");
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "store unreachable");
        assert!(json["backup_path"].is_null());
    }
}
