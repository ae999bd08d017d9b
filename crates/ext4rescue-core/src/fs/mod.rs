/// File system detection and module organization
use std::path::Path;

pub mod common;
pub mod ext4;

use crate::error::Result;
use common::BlockDevice;

/// Where a usable ext4 descriptor was found on an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// The primary superblock is intact
    Primary,
    /// Only a backup superblock is valid
    Backup { group: u32 },
}

/// Detect an ext4 volume, falling back to the backup superblocks
pub fn detect_filesystem(device_path: &Path) -> Result<Option<DescriptorState>> {
    let device = BlockDevice::open(device_path)?;

    if let Ok(primary) = device.read_bytes(ext4::SUPERBLOCK_OFFSET as u64, ext4::SUPERBLOCK_SIZE) {
        if ext4::is_ext4_superblock(primary) {
            return Ok(Some(DescriptorState::Primary));
        }
    }

    match ext4::locate(&device) {
        Ok(located) => Ok(located
            .source
            .map(|backup| DescriptorState::Backup { group: backup.group })),
        Err(e) if !e.is_io() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Get human-readable file system information
pub fn get_filesystem_info(device_path: &Path) -> Result<String> {
    let device = BlockDevice::open(device_path)?;
    ext4::get_filesystem_info(&device)
}
