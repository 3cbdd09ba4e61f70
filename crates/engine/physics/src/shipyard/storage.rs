//! Persisted shadow regions

use crate::error::Result;
use crate::voxel::OwnerId;
use glam::IVec3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One persisted region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub owner: OwnerId,
    pub origin: IVec3,
    pub size: IVec3,
}

/// Backing store for the region list
pub trait RegionStore: Send {
    fn load(&self) -> Result<Vec<RegionRecord>>;

    /// Replace the stored list
    fn save(&mut self, records: &[RegionRecord]) -> Result<()>;
}

/// bincode file; a missing file reads as an empty list
#[derive(Debug, Clone)]
pub struct FileRegionStore {
    path: PathBuf,
}

impl FileRegionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegionStore for FileRegionStore {
    fn load(&self) -> Result<Vec<RegionRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn save(&mut self, records: &[RegionRecord]) -> Result<()> {
        let bytes = bincode::serialize(records)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store; clones share the same list
#[derive(Debug, Clone, Default)]
pub struct MemoryRegionStore {
    records: Arc<Mutex<Vec<RegionRecord>>>,
}

impl MemoryRegionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RegionRecord> {
        match self.records.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl RegionStore for MemoryRegionStore {
    fn load(&self) -> Result<Vec<RegionRecord>> {
        Ok(self.records())
    }

    fn save(&mut self, records: &[RegionRecord]) -> Result<()> {
        let mut guard = match self.records.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = records.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: u64, x: i32) -> RegionRecord {
        RegionRecord {
            owner: OwnerId(owner),
            origin: IVec3::new(x, 64, 4),
            size: IVec3::new(3, 2, 5),
        }
    }

    #[test]
    fn test_file_store_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegionStore::new(dir.path().join("regions.bin"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regions.bin");
        let mut store = FileRegionStore::new(&path);
        store.save(&[record(1, 4), record(2, 15)]).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let reopened = FileRegionStore::new(&path);
        assert_eq!(reopened.load().unwrap(), vec![record(1, 4), record(2, 15)]);
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regions.bin");
        std::fs::write(&path, [0xff_u8; 3]).unwrap();
        let err = FileRegionStore::new(&path).load().unwrap_err();
        assert!(matches!(err, crate::error::PhysicsError::Storage(_)));
    }

    #[test]
    fn test_memory_store_shared_between_clones() {
        let store = MemoryRegionStore::new();
        let mut writer = store.clone();
        writer.save(&[record(7, 0)]).unwrap();
        assert_eq!(store.load().unwrap(), vec![record(7, 0)]);
    }
}
