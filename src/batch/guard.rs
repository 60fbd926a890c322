//! Classification of a single row copy.
//!
//! A copy that collides with a row already in the target is not an error:
//! it means an earlier run (or a concurrent migrator) got there first, and
//! the source row is still safe to delete. Every other integrity failure
//! rejects that one row and leaves it where it is.

use crate::core::{ContractId, MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum CopyOutcome {
    /// A new row now exists in the target.
    Inserted,
    /// The target already held this id.
    AlreadyPresent,
    /// The target refused the row. The source row stays put.
    Rejected(String),
    /// The source row was gone or no longer matched when re-checked.
    NotEligible,
}

impl CopyOutcome {
    /// Whether the source row may be deleted in the same transaction.
    pub fn is_movable(&self) -> bool {
        matches!(self, CopyOutcome::Inserted | CopyOutcome::AlreadyPresent)
    }
}

impl fmt::Display for CopyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyOutcome::Inserted => write!(f, "inserted"),
            CopyOutcome::AlreadyPresent => write!(f, "already present"),
            CopyOutcome::Rejected(reason) => write!(f, "rejected: {}", reason),
            CopyOutcome::NotEligible => write!(f, "not eligible"),
        }
    }
}

/// Turns the raw result of an `INSERT ... SELECT` for one id into a
/// [`CopyOutcome`].
///
/// Timeouts, lost connections and store faults pass through as errors so
/// the caller can abandon the sub-batch.
pub struct DuplicateGuard;

impl DuplicateGuard {
    pub fn classify(id: ContractId, attempt: Result<u64>) -> Result<CopyOutcome> {
        match attempt {
            Ok(0) => Ok(CopyOutcome::NotEligible),
            Ok(_) => Ok(CopyOutcome::Inserted),
            Err(MigrationError::UniqueViolation(detail)) => {
                tracing::debug!(id, %detail, "target already holds row");
                Ok(CopyOutcome::AlreadyPresent)
            }
            Err(err) if err.is_row_rejection() => {
                tracing::warn!(id, error = %err, "row rejected by target");
                Ok(CopyOutcome::Rejected(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_counts_map_to_outcomes() {
        assert_eq!(DuplicateGuard::classify(1, Ok(1)).unwrap(), CopyOutcome::Inserted);
        assert_eq!(DuplicateGuard::classify(1, Ok(0)).unwrap(), CopyOutcome::NotEligible);
    }

    #[test]
    fn unique_violation_counts_as_present() {
        let outcome =
            DuplicateGuard::classify(1, Err(MigrationError::UniqueViolation("pk".into()))).unwrap();
        assert_eq!(outcome, CopyOutcome::AlreadyPresent);
        assert!(outcome.is_movable());
    }

    #[test]
    fn check_failure_rejects_only_the_row() {
        let outcome =
            DuplicateGuard::classify(1, Err(MigrationError::Constraint("chk".into()))).unwrap();
        assert!(matches!(outcome, CopyOutcome::Rejected(ref r) if r.contains("chk")));
        assert!(!outcome.is_movable());
    }

    #[test]
    fn infrastructure_errors_propagate() {
        let err = DuplicateGuard::classify(1, Err(MigrationError::StatementTimeout("slow".into())))
            .unwrap_err();
        assert!(err.is_timeout());
        let err = DuplicateGuard::classify(1, Err(MigrationError::Connectivity("gone".into())))
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
