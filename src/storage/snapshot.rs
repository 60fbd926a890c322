//! On-disk snapshots of a [`MemoryStageStore`](super::MemoryStageStore).

use crate::core::{ContractRecord, DocumentLink, MigrationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Committed contents of every stage table, keyed by physical table name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub tables: BTreeMap<String, Vec<ContractRecord>>,
    pub links: Vec<DocumentLink>,
}

impl MemorySnapshot {
    pub fn new(tables: BTreeMap<String, Vec<ContractRecord>>, links: Vec<DocumentLink>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            tables,
            links,
        }
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `<path>.tmp`, syncs it, then renames over `path`.
    pub fn save(&self, snapshot: &MemorySnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.temp_path();
        let serialized = rmp_serde::to_vec(snapshot).map_err(|e| {
            MigrationError::Serialization(format!("failed to encode snapshot: {}", e))
        })?;

        let mut writer = BufWriter::new(File::create(&temp_path)?);
        writer.write_all(&serialized)?;
        writer.flush()?;
        writer.get_mut().sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<MemorySnapshot> {
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;
        let snapshot: MemorySnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            MigrationError::Serialization(format!(
                "failed to decode snapshot {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MigrationError::Serialization(format!(
                "snapshot {} has version {}, expected {}",
                self.path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Registry;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(temp_dir.path().join("nested").join("store.snapshot"));

        let mut tables = BTreeMap::new();
        tables.insert(
            "reestr_contract_44_fz".to_string(),
            vec![ContractRecord::new(1).field("customer", "city hospital")],
        );
        let links = vec![DocumentLink {
            id: 1,
            registry: Registry::Fz44,
            contract_id: 1,
            url: "https://example.org/doc/1".to_string(),
        }];
        file.save(&MemorySnapshot::new(tables, links)).unwrap();

        let loaded = file.load().unwrap();
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert_eq!(loaded.row_count(), 1);
        assert_eq!(loaded.links.len(), 1);
        assert!(!temp_dir.path().join("nested").join("store.snapshot.tmp").exists());
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.snapshot");
        fs::write(&path, b"not messagepack").unwrap();

        let err = SnapshotFile::new(&path).load().unwrap_err();
        assert!(matches!(err, MigrationError::Serialization(_)));
    }
}
