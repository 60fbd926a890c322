// ============================================================================
// Pre-run snapshots
// ============================================================================
//
// A snapshot is taken before the day's migrations when none exists yet, when
// forced, or on the weekly day. Only the newest snapshots are retained.
//
// ============================================================================

pub mod memory;
pub mod pg_dump;
pub mod schedule;

pub use memory::{MemorySnapshotBackup, MemorySnapshotWriter};
pub use pg_dump::{PgDumpBackup, PgDumpTarget, PgDumpWriter};
pub use schedule::{SnapshotDir, SnapshotSchedule};

use crate::core::{MigrationError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[async_trait]
pub trait BackupGate: Send + Sync {
    /// Takes a snapshot if one is due. Returns its path, or `None` when
    /// nothing was written.
    async fn maybe_snapshot(&self, force: bool, now: NaiveDateTime) -> Result<Option<PathBuf>>;
}

/// Produces one snapshot file.
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    fn extension(&self) -> &'static str;

    async fn write(&self, path: &Path) -> Result<()>;
}

/// A [`SnapshotWriter`] run on a [`SnapshotSchedule`].
pub struct ScheduledBackup<W> {
    writer: W,
    dir: SnapshotDir,
    schedule: SnapshotSchedule,
}

impl<W: SnapshotWriter> ScheduledBackup<W> {
    pub fn new(writer: W, dir: impl Into<PathBuf>, prefix: &str, schedule: SnapshotSchedule) -> Self {
        let dir = SnapshotDir::new(dir, prefix, writer.extension());
        Self { writer, dir, schedule }
    }

    pub fn snapshots(&self) -> Result<Vec<PathBuf>> {
        self.dir.existing()
    }
}

#[async_trait]
impl<W: SnapshotWriter> BackupGate for ScheduledBackup<W> {
    async fn maybe_snapshot(&self, force: bool, now: NaiveDateTime) -> Result<Option<PathBuf>> {
        let existing = self.dir.existing()?;
        if !self.schedule.is_due(existing.len(), force, now.date()) {
            info!(latest = ?existing.first(), "snapshot not due");
            return Ok(None);
        }

        std::fs::create_dir_all(self.dir.dir())?;
        let path = self.dir.path_for(now);
        info!(path = %path.display(), forced = force, "taking snapshot");

        if let Err(err) = self.writer.write(&path).await {
            if path.exists() && let Err(cleanup) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %cleanup, "could not remove partial snapshot");
            }
            return Err(match err {
                MigrationError::Backup(_) => err,
                other => MigrationError::Backup(other.to_string()),
            });
        }

        for removed in self.dir.prune(self.schedule.keep, &path)? {
            info!(path = %removed.display(), "removed old snapshot");
        }
        Ok(Some(path))
    }
}

/// Never snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBackup;

#[async_trait]
impl BackupGate for DisabledBackup {
    async fn maybe_snapshot(&self, _force: bool, _now: NaiveDateTime) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}
