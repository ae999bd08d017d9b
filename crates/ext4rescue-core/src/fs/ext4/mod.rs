/// ext4 on-disk structures and the volume-level accessors built on them
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::common::BlockDevice;
use crate::error::Result;

pub mod dirent;
pub mod extent;
pub mod group;
pub mod inode;
pub mod locator;
pub mod superblock;
pub mod volume;

pub use dirent::{decode_directory_block, DirectoryRecord, DirectoryRecords, EntryType};
pub use extent::{Extent, ExtentEntries, ExtentHeader, ExtentIndex, ExtentNode};
pub use group::{read_groups, GroupDescriptor};
pub use inode::{BlockMap, FileRecord, RecordKind};
pub use locator::{
    find_volumes, locate, restore_primary_descriptor, BackupCandidate, FoundVolume,
    LocatedDescriptor,
};
pub use superblock::{Descriptor, Geometry};
pub use volume::Volume;

/// Primary superblock lives at this byte offset regardless of block size
pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_MAGIC: u16 = 0xEF53;
const MAGIC_OFFSET: usize = 56;

/// Record number of the root directory
pub const ROOT_RECORD: u32 = 2;

// Compatible features
pub const COMPAT_RESIZE_INODE: u32 = 0x0010;

// Incompatible features
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;

// Read-only compatible features
pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;

// Inode flags
pub const EXTENTS_FL: u32 = 0x0008_0000;
pub const INLINE_DATA_FL: u32 = 0x1000_0000;

/// Check if data carries the ext4 magic at the superblock's magic offset.
///
/// `data` is the 1024-byte superblock itself, not the start of the image.
pub fn is_ext4_superblock(data: &[u8]) -> bool {
    if data.len() < MAGIC_OFFSET + 2 {
        return false;
    }

    let mut cursor = Cursor::new(&data[MAGIC_OFFSET..]);
    matches!(cursor.read_u16::<LittleEndian>(), Ok(EXT4_MAGIC))
}

/// Get ext4 file system information, falling back to a backup descriptor
pub fn get_filesystem_info(device: &BlockDevice) -> Result<String> {
    let located = locate(device)?;
    let sb = &located.descriptor;

    let fs_size_mb = (sb.total_blocks() * sb.block_size()) / (1024 * 1024);
    let source = match located.source {
        None => "primary".to_string(),
        Some(ref backup) => format!(
            "backup in group {} at offset {} ({}-byte blocks)",
            backup.group, backup.offset, backup.block_size
        ),
    };
    let created = sb
        .created_time()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());

    Ok(format!(
        "ext4 File System\n\
         - Descriptor: {}\n\
         - Volume Name: {}\n\
         - Block Size: {} bytes\n\
         - Total Blocks: {}\n\
         - Free Blocks: {}\n\
         - File System Size: {} MB\n\
         - Block Groups: {}\n\
         - Blocks per Group: {}\n\
         - Inodes: {} ({} per group, {} bytes each)\n\
         - 64-bit: {}\n\
         - Extents: {}\n\
         - Created: {}\n\
         - UUID: {}",
        source,
        sb.volume_name(),
        sb.block_size(),
        sb.total_blocks(),
        sb.free_blocks(),
        fs_size_mb,
        sb.group_count(),
        sb.blocks_per_group,
        sb.inodes_count,
        sb.inodes_per_group,
        sb.record_size(),
        sb.is_wide(),
        sb.has_extents(),
        created,
        sb.uuid().hyphenated()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_detection() {
        let mut data = vec![0u8; 1024];
        assert!(!is_ext4_superblock(&data));
        data[56] = 0x53;
        data[57] = 0xEF;
        assert!(is_ext4_superblock(&data));
        assert!(!is_ext4_superblock(&data[..57]));
    }
}
