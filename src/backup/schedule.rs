use crate::core::Result;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PREFIX: &str = "tendermonitor_backup_";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// When a snapshot is due, and how many to retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSchedule {
    pub weekly_day: Weekday,
    pub keep: usize,
}

impl SnapshotSchedule {
    pub fn standard() -> Self {
        Self {
            weekly_day: Weekday::Sun,
            keep: 1,
        }
    }

    /// Due when forced, when nothing exists yet, or on the weekly day.
    pub fn is_due(&self, existing: usize, force: bool, today: NaiveDate) -> bool {
        force || existing == 0 || today.weekday() == self.weekly_day
    }
}

impl Default for SnapshotSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

/// A directory of timestamped snapshot files sharing a prefix.
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    dir: PathBuf,
    prefix: String,
    extension: String,
}

impl SnapshotDir {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<prefix><YYYYmmdd_HHMMSS>.<extension>`
    pub fn path_for(&self, now: NaiveDateTime) -> PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            self.prefix,
            now.format(STAMP_FORMAT),
            self.extension
        ))
    }

    /// Existing snapshots, newest first. A missing directory holds none.
    pub fn existing(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let suffix = format!(".{}", self.extension);
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&self.prefix) && name.ends_with(&suffix) {
                found.push(entry.path());
            }
        }
        found.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(found)
    }

    /// Deletes all but the `keep` newest snapshots. `current` is never
    /// deleted and counts towards `keep`.
    pub fn prune(&self, keep: usize, current: &Path) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        let older = self.existing()?.into_iter().filter(|p| p != current);
        for path in older.skip(keep.saturating_sub(1)) {
            fs::remove_file(&path)?;
            removed.push(path);
        }
        Ok(removed)
    }
}
