// ============================================================================
// Tender Lifecycle Migrator
// ============================================================================
//
// Moves procurement contracts between per-stage tables as their dates say
// they should: Active -> CommissionReview -> Awarded / Unclear -> Completed,
// with Unknown and Bad as dead ends for the 44-FZ registry.

pub mod core;
pub mod lifecycle;
pub mod batch;
pub mod storage;
pub mod transaction;
pub mod backup;
pub mod config;
pub mod facade;
pub mod telemetry;

// Re-export main types for convenience
pub use facade::{Migrator, RunOptions};
pub use config::MigratorConfig;
pub use core::{ContractId, ContractRecord, DocumentLink, MigrationError, Registry, Result, Stage, TableId, Value};
pub use lifecycle::{Predicate, RegistryReport, RunReport, Transition, TransitionPlan, TransitionReport};
pub use lifecycle::engine::PlannedTransition;

// Stores
pub use storage::{MemoryStageStore, PgStageStore, ReferentialAction, StageStore, StageTransaction};

// Backups
pub use backup::{BackupGate, DisabledBackup, MemorySnapshotBackup, PgDumpBackup};
