/// Block group descriptors and the group table reader
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::{debug, warn};

use super::superblock::{Descriptor, Geometry};
use super::SUPERBLOCK_OFFSET;
use crate::error::{RecoveryError, Result};
use crate::fs::common::BlockDevice;

const NARROW_SIZE: usize = 32;
const WIDE_SIZE: usize = 64;

/// One block group descriptor (`ext4_group_desc`).
///
/// The `_hi` halves are only present on disk when the 64-bit feature is set;
/// they decode as zero otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub block_bitmap_lo: u32,
    pub inode_bitmap_lo: u32,
    pub inode_table_lo: u32,
    pub free_blocks_count_lo: u16,
    pub free_inodes_count_lo: u16,
    pub used_dirs_count_lo: u16,
    pub flags: u16,
    pub exclude_bitmap_lo: u32,
    pub block_bitmap_csum_lo: u16,
    pub inode_bitmap_csum_lo: u16,
    pub itable_unused_lo: u16,
    pub checksum: u16,
    pub block_bitmap_hi: u32,
    pub inode_bitmap_hi: u32,
    pub inode_table_hi: u32,
    pub free_blocks_count_hi: u16,
    pub free_inodes_count_hi: u16,
    pub used_dirs_count_hi: u16,
    pub itable_unused_hi: u16,
    pub exclude_bitmap_hi: u32,
    pub block_bitmap_csum_hi: u16,
    pub inode_bitmap_csum_hi: u16,
}

impl GroupDescriptor {
    /// Decode one entry; `wide` selects the 64-byte layout
    pub fn parse(data: &[u8], wide: bool) -> Result<Self> {
        let needed = if wide { WIDE_SIZE } else { NARROW_SIZE };
        if data.len() < needed {
            return Err(RecoveryError::invalid(format!(
                "group descriptor needs {} bytes, got {}",
                needed,
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let mut gd = GroupDescriptor {
            block_bitmap_lo: cursor.read_u32::<LittleEndian>()?,
            inode_bitmap_lo: cursor.read_u32::<LittleEndian>()?,
            inode_table_lo: cursor.read_u32::<LittleEndian>()?,
            free_blocks_count_lo: cursor.read_u16::<LittleEndian>()?,
            free_inodes_count_lo: cursor.read_u16::<LittleEndian>()?,
            used_dirs_count_lo: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            exclude_bitmap_lo: cursor.read_u32::<LittleEndian>()?,
            block_bitmap_csum_lo: cursor.read_u16::<LittleEndian>()?,
            inode_bitmap_csum_lo: cursor.read_u16::<LittleEndian>()?,
            itable_unused_lo: cursor.read_u16::<LittleEndian>()?,
            checksum: cursor.read_u16::<LittleEndian>()?,
            ..Default::default()
        };

        if wide {
            gd.block_bitmap_hi = cursor.read_u32::<LittleEndian>()?;
            gd.inode_bitmap_hi = cursor.read_u32::<LittleEndian>()?;
            gd.inode_table_hi = cursor.read_u32::<LittleEndian>()?;
            gd.free_blocks_count_hi = cursor.read_u16::<LittleEndian>()?;
            gd.free_inodes_count_hi = cursor.read_u16::<LittleEndian>()?;
            gd.used_dirs_count_hi = cursor.read_u16::<LittleEndian>()?;
            gd.itable_unused_hi = cursor.read_u16::<LittleEndian>()?;
            gd.exclude_bitmap_hi = cursor.read_u32::<LittleEndian>()?;
            gd.block_bitmap_csum_hi = cursor.read_u16::<LittleEndian>()?;
            gd.inode_bitmap_csum_hi = cursor.read_u16::<LittleEndian>()?;
        }

        Ok(gd)
    }

    /// Encode as a 32- or 64-byte entry
    pub fn to_bytes(&self, wide: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WIDE_SIZE);
        // Vec writes cannot fail
        let _ = self.write_fields(&mut buf, wide);
        buf.resize(if wide { WIDE_SIZE } else { NARROW_SIZE }, 0);
        buf
    }

    fn write_fields(&self, buf: &mut Vec<u8>, wide: bool) -> std::io::Result<()> {
        buf.write_u32::<LittleEndian>(self.block_bitmap_lo)?;
        buf.write_u32::<LittleEndian>(self.inode_bitmap_lo)?;
        buf.write_u32::<LittleEndian>(self.inode_table_lo)?;
        buf.write_u16::<LittleEndian>(self.free_blocks_count_lo)?;
        buf.write_u16::<LittleEndian>(self.free_inodes_count_lo)?;
        buf.write_u16::<LittleEndian>(self.used_dirs_count_lo)?;
        buf.write_u16::<LittleEndian>(self.flags)?;
        buf.write_u32::<LittleEndian>(self.exclude_bitmap_lo)?;
        buf.write_u16::<LittleEndian>(self.block_bitmap_csum_lo)?;
        buf.write_u16::<LittleEndian>(self.inode_bitmap_csum_lo)?;
        buf.write_u16::<LittleEndian>(self.itable_unused_lo)?;
        buf.write_u16::<LittleEndian>(self.checksum)?;
        if wide {
            buf.write_u32::<LittleEndian>(self.block_bitmap_hi)?;
            buf.write_u32::<LittleEndian>(self.inode_bitmap_hi)?;
            buf.write_u32::<LittleEndian>(self.inode_table_hi)?;
            buf.write_u16::<LittleEndian>(self.free_blocks_count_hi)?;
            buf.write_u16::<LittleEndian>(self.free_inodes_count_hi)?;
            buf.write_u16::<LittleEndian>(self.used_dirs_count_hi)?;
            buf.write_u16::<LittleEndian>(self.itable_unused_hi)?;
            buf.write_u32::<LittleEndian>(self.exclude_bitmap_hi)?;
            buf.write_u16::<LittleEndian>(self.block_bitmap_csum_hi)?;
            buf.write_u16::<LittleEndian>(self.inode_bitmap_csum_hi)?;
        }
        Ok(())
    }

    pub fn block_bitmap_location(&self) -> u64 {
        ((self.block_bitmap_hi as u64) << 32) | self.block_bitmap_lo as u64
    }

    pub fn record_bitmap_location(&self) -> u64 {
        ((self.inode_bitmap_hi as u64) << 32) | self.inode_bitmap_lo as u64
    }

    pub fn record_table_location(&self) -> u64 {
        ((self.inode_table_hi as u64) << 32) | self.inode_table_lo as u64
    }

    pub fn free_blocks(&self) -> u32 {
        ((self.free_blocks_count_hi as u32) << 16) | self.free_blocks_count_lo as u32
    }

    pub fn free_records(&self) -> u32 {
        ((self.free_inodes_count_hi as u32) << 16) | self.free_inodes_count_lo as u32
    }

    pub fn used_dirs(&self) -> u32 {
        ((self.used_dirs_count_hi as u32) << 16) | self.used_dirs_count_lo as u32
    }

    /// Set the three location fields, splitting across lo/hi halves
    pub fn set_locations(&mut self, block_bitmap: u64, record_bitmap: u64, record_table: u64) {
        self.block_bitmap_lo = block_bitmap as u32;
        self.block_bitmap_hi = (block_bitmap >> 32) as u32;
        self.inode_bitmap_lo = record_bitmap as u32;
        self.inode_bitmap_hi = (record_bitmap >> 32) as u32;
        self.inode_table_lo = record_table as u32;
        self.inode_table_hi = (record_table >> 32) as u32;
    }
}

/// Load the group table that follows the primary descriptor
pub fn read_groups(device: &BlockDevice, descriptor: &Descriptor) -> Result<Vec<GroupDescriptor>> {
    read_groups_after(device, descriptor, SUPERBLOCK_OFFSET as u64)
}

/// Load the group table that follows the descriptor stored at `descriptor_offset`.
///
/// Short or unreadable tables yield fewer entries than the group count rather
/// than an error; only an unusable geometry fails.
pub fn read_groups_after(
    device: &BlockDevice,
    descriptor: &Descriptor,
    descriptor_offset: u64,
) -> Result<Vec<GroupDescriptor>> {
    let geometry = descriptor.geometry()?;
    let table_block = descriptor_offset / geometry.block_size as u64 + 1;
    Ok(read_group_table(device, &geometry, table_block))
}

/// Slice `group_count` entries out of the table starting at `table_block`
pub fn read_group_table(
    device: &BlockDevice,
    geometry: &Geometry,
    table_block: u64,
) -> Vec<GroupDescriptor> {
    let entry_size = geometry.desc_size as usize;
    let wanted = geometry.group_count as usize;
    let block_size = geometry.block_size as usize;
    let per_block = block_size / entry_size;
    let mut groups = Vec::with_capacity(wanted);

    for block_index in 0..geometry.group_table_blocks() {
        let block = match device.read_block(table_block + block_index, geometry.block_size) {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    "⚠️ Group table block {} unreadable: {}",
                    table_block + block_index,
                    e
                );
                break;
            }
        };

        for slot in 0..per_block {
            if groups.len() == wanted {
                break;
            }
            let start = slot * entry_size;
            match GroupDescriptor::parse(&block[start..start + entry_size], geometry.wide) {
                Ok(gd) => groups.push(gd),
                Err(e) => {
                    warn!("⚠️ Group descriptor {} undecodable: {}", groups.len(), e);
                    return groups;
                }
            }
        }
    }

    debug!(
        "Loaded {}/{} group descriptors from block {}",
        groups.len(),
        wanted,
        table_block
    );
    groups
}
