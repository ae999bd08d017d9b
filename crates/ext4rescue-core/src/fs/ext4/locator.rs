/// Primary/backup superblock discovery and restoration
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind};
use tracing::{debug, info, warn};

use super::superblock::Descriptor;
use super::{SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use crate::config::VolumeScanConfig;
use crate::error::{RecoveryError, Result};
use crate::fs::common::BlockDevice;
use crate::recovery::backup::BackupStore;

const CANDIDATE_BLOCK_SIZES: [u32; 3] = [1024, 2048, 4096];
const MAX_CANDIDATE_GROUPS: usize = 15;
const BLOCK_GROUP_NR_OFFSET: usize = 90;
const SECTOR_SIZE: u64 = 512;

/// A valid superblock copy found in a backup group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCandidate {
    pub group: u32,
    pub offset: u64,
    pub block_size: u32,
    pub descriptor: Descriptor,
}

/// Authoritative descriptor for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatedDescriptor {
    pub descriptor: Descriptor,
    /// Byte offset the descriptor was read from
    pub offset: u64,
    /// Backup the descriptor came from; `None` for the primary
    pub source: Option<BackupCandidate>,
    /// Every valid backup seen at the winning block size
    pub backups: Vec<BackupCandidate>,
}

impl LocatedDescriptor {
    pub fn is_primary(&self) -> bool {
        self.source.is_none()
    }
}

/// Groups that hold superblock backups under sparse_super: 1 and the powers of
/// 3, 5 and 7, here bounded below 100 and capped at 15 entries.
pub fn candidate_groups() -> Vec<u32> {
    let mut groups = vec![1u32];
    for base in [3u32, 5, 7] {
        let mut power = base;
        while power < 100 {
            groups.push(power);
            power *= base;
        }
    }
    groups.sort_unstable();
    groups.dedup();
    groups.truncate(MAX_CANDIDATE_GROUPS);
    groups
}

/// Byte offset of the backup superblock in `group`. Only 1 KiB blocks carry
/// the boot-block reservation.
pub fn backup_offset(group: u32, blocks_per_group: u32, block_size: u32) -> u64 {
    let base = group as u64 * blocks_per_group as u64 * block_size as u64;
    if block_size == 1024 {
        base + SUPERBLOCK_OFFSET as u64
    } else {
        base
    }
}

fn read_descriptor(device: &BlockDevice, offset: u64) -> Result<Descriptor> {
    let data = device.read_bytes(offset, SUPERBLOCK_SIZE)?;
    Descriptor::parse(data)
}

/// Valid backups among the candidate groups for one geometry, lowest group first
pub fn find_backups(
    device: &BlockDevice,
    block_size: u32,
    blocks_per_group: u32,
) -> Vec<BackupCandidate> {
    let mut found = Vec::new();

    for group in candidate_groups() {
        let offset = backup_offset(group, blocks_per_group, block_size);
        match read_descriptor(device, offset) {
            Ok(descriptor) => {
                debug!(
                    "Backup superblock in group {} at offset {} ({}-byte blocks)",
                    group, offset, block_size
                );
                found.push(BackupCandidate {
                    group,
                    offset,
                    block_size,
                    descriptor,
                });
            }
            Err(e) => debug!("No backup in group {} at offset {}: {}", group, offset, e),
        }
    }

    found
}

/// Find the authoritative descriptor: the primary if valid, else the
/// lowest-group backup of the first block size that yields any backup.
pub fn locate(device: &BlockDevice) -> Result<LocatedDescriptor> {
    match read_descriptor(device, SUPERBLOCK_OFFSET as u64) {
        Ok(descriptor) => {
            info!("✅ Primary superblock valid");
            return Ok(LocatedDescriptor {
                descriptor,
                offset: SUPERBLOCK_OFFSET as u64,
                source: None,
                backups: Vec::new(),
            });
        }
        Err(e) => warn!("⚠️ Primary superblock unusable: {}", e),
    }

    for block_size in CANDIDATE_BLOCK_SIZES {
        let backups = find_backups(device, block_size, block_size * 8);
        if let Some(first) = backups.first().cloned() {
            info!(
                "🔍 Using backup superblock from group {} at offset {} ({} backups with {}-byte blocks)",
                first.group,
                first.offset,
                backups.len(),
                block_size
            );
            return Ok(LocatedDescriptor {
                descriptor: first.descriptor.clone(),
                offset: first.offset,
                source: Some(first),
                backups,
            });
        }
    }

    Err(RecoveryError::not_found(
        "no valid primary or backup superblock",
    ))
}

/// Copy the authoritative backup over the primary location, saving the
/// current primary bytes through `store` first. Returns `false` when the
/// primary was already authoritative.
pub fn restore_primary_descriptor(
    device: &mut BlockDevice,
    located: &LocatedDescriptor,
    store: &mut dyn BackupStore,
) -> Result<bool> {
    let Some(source) = &located.source else {
        info!("Primary superblock already valid, nothing to restore");
        return Ok(false);
    };

    if !device.is_writable() {
        return Err(IoError::new(ErrorKind::PermissionDenied, "device opened read-only").into());
    }

    let mut replacement = device
        .read_bytes(source.offset, SUPERBLOCK_SIZE)?
        .to_vec();
    // A backup records its own group number; the primary lives in group 0
    replacement[BLOCK_GROUP_NR_OFFSET..BLOCK_GROUP_NR_OFFSET + 2].copy_from_slice(&[0, 0]);

    let original = device
        .read_bytes(SUPERBLOCK_OFFSET as u64, SUPERBLOCK_SIZE)?
        .to_vec();
    store.save("primary-superblock", SUPERBLOCK_OFFSET as u64, &original)?;

    device.write_bytes(SUPERBLOCK_OFFSET as u64, &replacement)?;
    device.flush()?;

    info!(
        "✅ Restored primary superblock from group {} backup",
        source.group
    );
    Ok(true)
}

/// ext4 volume found inside a larger image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundVolume {
    pub offset: u64,
    pub start_sector: u64,
    pub size_bytes: u64,
    pub block_size: u64,
    pub descriptor: Descriptor,
}

/// Step through a raw disk image looking for primary superblocks
pub fn find_volumes(device: &BlockDevice, config: &VolumeScanConfig) -> Vec<FoundVolume> {
    let limit = device.size().min(config.limit);
    let step = config.step.max(SECTOR_SIZE);
    let mut volumes = Vec::new();
    let mut offset = 0u64;

    while offset + (SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE) as u64 <= limit {
        if let Ok(descriptor) = read_descriptor(device, offset + SUPERBLOCK_OFFSET as u64) {
            // Backups of 1 KiB-block volumes also sit at offset + 1024
            if descriptor.block_group_nr == 0 && descriptor.geometry().is_ok() {
                let size_bytes = descriptor.total_blocks() * descriptor.block_size();
                info!(
                    "🔍 ext4 volume at offset {} ({} bytes, {}-byte blocks)",
                    offset,
                    size_bytes,
                    descriptor.block_size()
                );
                volumes.push(FoundVolume {
                    offset,
                    start_sector: offset / SECTOR_SIZE,
                    size_bytes,
                    block_size: descriptor.block_size(),
                    descriptor,
                });
            }
        }
        offset += step;
    }

    volumes
}
