/// Pre-write backups of image regions
///
/// Every mutating recovery step saves the bytes it is about to overwrite
/// before the first write, so an interrupted repair can be rolled back.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{RecoveryError, Result};
use crate::fs::common::BlockDevice;

pub trait BackupStore {
    /// Persist `data`, which currently lives at byte `offset` of the image
    fn save(&mut self, label: &str, offset: u64, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub label: String,
    pub offset: u64,
    pub length: u64,
}

const MANIFEST: &str = "manifest.json";

/// Writes `<label>.bak` files plus a JSON manifest into a directory
pub struct DirBackupStore {
    dir: PathBuf,
    manifest: Vec<BackupEntry>,
}

impl DirBackupStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let manifest_path = dir.join(MANIFEST);
        let manifest = if manifest_path.exists() {
            let text = fs::read_to_string(&manifest_path)?;
            serde_json::from_str(&text)
                .map_err(|e| RecoveryError::invalid(format!("backup manifest: {}", e)))?
        } else {
            Vec::new()
        };

        Ok(Self { dir, manifest })
    }

    pub fn entries(&self) -> &[BackupEntry] {
        &self.manifest
    }

    fn file_name(label: &str) -> String {
        let safe: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}.bak", safe)
    }

    /// Write every saved region back into the image
    pub fn restore_all(&self, device: &mut BlockDevice) -> Result<usize> {
        for entry in &self.manifest {
            let data = fs::read(self.dir.join(Self::file_name(&entry.label)))?;
            device.write_bytes(entry.offset, &data)?;
        }
        device.flush()?;
        info!("♻️ Restored {} backed-up regions", self.manifest.len());
        Ok(self.manifest.len())
    }
}

impl BackupStore for DirBackupStore {
    fn save(&mut self, label: &str, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.dir.join(Self::file_name(label));
        fs::write(&path, data)?;

        self.manifest.retain(|e| e.label != label);
        self.manifest.push(BackupEntry {
            label: label.to_string(),
            offset,
            length: data.len() as u64,
        });
        let text = serde_json::to_string_pretty(&self.manifest)
            .map_err(|e| RecoveryError::invalid(format!("backup manifest: {}", e)))?;
        fs::write(self.dir.join(MANIFEST), text)?;

        info!("💾 Backed up {} bytes at offset {} to {}", data.len(), offset, path.display());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRegion {
    pub label: String,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Keeps backups in memory
#[derive(Debug, Default)]
pub struct MemoryBackupStore {
    pub entries: Vec<SavedRegion>,
}

impl BackupStore for MemoryBackupStore {
    fn save(&mut self, label: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.entries.push(SavedRegion {
            label: label.to_string(),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_store_writes_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = DirBackupStore::new(tmp.path().join("backups")).unwrap();
        store.save("block-bitmap-0", 3072, &[1, 2, 3]).unwrap();
        store.save("block-bitmap-0", 3072, &[4, 5, 6]).unwrap();
        store.save("inode/bitmap", 4096, &[9]).unwrap();

        assert_eq!(store.entries().len(), 2);
        assert_eq!(
            fs::read(tmp.path().join("backups/block-bitmap-0.bak")).unwrap(),
            vec![4, 5, 6]
        );
        assert!(tmp.path().join("backups/inode_bitmap.bak").exists());

        let reopened = DirBackupStore::new(tmp.path().join("backups")).unwrap();
        assert_eq!(reopened.entries(), store.entries());
    }

    #[test]
    fn test_restore_all() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = DirBackupStore::new(tmp.path()).unwrap();
        store.save("region", 4, b"keep").unwrap();

        let mut device = BlockDevice::from_bytes(vec![0u8; 16]);
        assert_eq!(store.restore_all(&mut device).unwrap(), 1);
        assert_eq!(device.read_bytes(4, 4).unwrap(), b"keep");
    }
}
