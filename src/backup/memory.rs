use super::schedule::SnapshotSchedule;
use super::{ScheduledBackup, SnapshotWriter};
use crate::core::{MigrationError, Result};
use crate::storage::MemoryStageStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub type MemorySnapshotBackup = ScheduledBackup<MemorySnapshotWriter>;

impl MemorySnapshotBackup {
    pub fn memory(store: MemoryStageStore, dir: impl Into<PathBuf>, prefix: &str, schedule: SnapshotSchedule) -> Self {
        ScheduledBackup::new(MemorySnapshotWriter::new(store), dir, prefix, schedule)
    }
}

/// Writes a MessagePack snapshot of a [`MemoryStageStore`].
#[derive(Clone)]
pub struct MemorySnapshotWriter {
    store: MemoryStageStore,
}

impl MemorySnapshotWriter {
    pub fn new(store: MemoryStageStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SnapshotWriter for MemorySnapshotWriter {
    fn extension(&self) -> &'static str {
        "snapshot"
    }

    async fn write(&self, path: &Path) -> Result<()> {
        let store = self.store.clone();
        let path = path.to_path_buf();
        let rows = tokio::task::spawn_blocking(move || store.save(&path))
            .await
            .map_err(|e| MigrationError::Backup(format!("snapshot task failed: {}", e)))??;
        tracing::debug!(rows, "memory snapshot written");
        Ok(())
    }
}
