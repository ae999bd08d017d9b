/// Block and record bitmap reconstruction from a full record scan
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fs::common::BlockDevice;
use crate::fs::ext4::{BlockMap, FileRecord, Geometry, Volume};
use crate::recovery::backup::BackupStore;

/// Rebuilt bitmaps of one group plus where they live on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBitmaps {
    pub group: u32,
    pub block_bitmap_location: u64,
    pub record_bitmap_location: u64,
    pub block_bitmap: Vec<u8>,
    pub record_bitmap: Vec<u8>,
}

impl GroupBitmaps {
    pub fn used_blocks(&self) -> u32 {
        self.block_bitmap.iter().map(|b| b.count_ones()).sum()
    }

    pub fn used_records(&self) -> u32 {
        self.record_bitmap.iter().map(|b| b.count_ones()).sum()
    }
}

/// Changed bits between the on-disk and rebuilt bitmaps of a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapDelta {
    pub group: u32,
    pub block_bits_changed: u32,
    pub record_bits_changed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuiltBitmaps {
    pub block_size: u32,
    pub groups: Vec<GroupBitmaps>,
}

fn set_bit(bitmap: &mut [u8], bit: u32) {
    let byte = (bit / 8) as usize;
    if let Some(b) = bitmap.get_mut(byte) {
        *b |= 1 << (bit % 8);
    }
}

fn bits_differ(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// True when `group` holds a superblock backup under sparse_super
fn is_sparse_backup_group(group: u32) -> bool {
    if group <= 1 {
        return true;
    }
    [3u32, 5, 7].iter().any(|&base| {
        let mut n = group;
        while n % base == 0 {
            n /= base;
        }
        n == 1
    })
}

/// Derives allocation bitmaps from group metadata and in-use records
pub struct BitmapRebuilder<'v, 'a> {
    volume: &'v Volume<'a>,
}

impl<'v, 'a> BitmapRebuilder<'v, 'a> {
    pub fn new(volume: &'v Volume<'a>) -> Self {
        Self { volume }
    }

    /// Rebuild every loaded group's bitmaps. Records with a zero mode are
    /// ignored, so a raw scan can be passed straight in.
    pub fn rebuild(&self, records: &[(u32, FileRecord)]) -> RebuiltBitmaps {
        let geometry = *self.volume.geometry();
        let block_bytes = geometry.blocks_per_group.div_ceil(8) as usize;
        let record_bytes = geometry.records_per_group.div_ceil(8) as usize;

        let mut groups: Vec<GroupBitmaps> = self
            .volume
            .groups()
            .iter()
            .enumerate()
            .map(|(i, gd)| GroupBitmaps {
                group: i as u32,
                block_bitmap_location: gd.block_bitmap_location(),
                record_bitmap_location: gd.record_bitmap_location(),
                block_bitmap: vec![0u8; block_bytes],
                record_bitmap: vec![0u8; record_bytes],
            })
            .collect();

        self.mark_metadata(&geometry, &mut groups);

        let mut marked_records = 0usize;
        for (number, record) in records.iter().filter(|(_, r)| r.is_valid()) {
            match geometry.record_location(*number) {
                Some((group, index)) if (group as usize) < groups.len() => {
                    set_bit(&mut groups[group as usize].record_bitmap, index);
                    marked_records += 1;
                }
                _ => {
                    debug!("Record {} outside loaded groups", number);
                    continue;
                }
            }
            self.mark_record_blocks(&geometry, &mut groups, *number, record);
        }

        info!(
            "🧮 Rebuilt bitmaps for {} groups from {} records",
            groups.len(),
            marked_records
        );

        RebuiltBitmaps {
            block_size: geometry.block_size,
            groups,
        }
    }

    fn mark_metadata(&self, geometry: &Geometry, groups: &mut [GroupBitmaps]) {
        let descriptor = self.volume.descriptor();
        let sparse = descriptor.has_sparse_super();
        let table_blocks = geometry.group_table_blocks();
        let reserved = descriptor.reserved_gdt_blocks as u64;

        for (i, gd) in self.volume.groups().iter().enumerate() {
            let group = i as u32;

            if !sparse || is_sparse_backup_group(group) {
                let first = geometry.group_first_block(group);
                // Superblock (and boot block for group 0), then the group table
                // and its reserved growth area
                for block in first..=first.saturating_add(table_blocks + reserved) {
                    mark_block(geometry, groups, block);
                }
            }

            mark_block(geometry, groups, gd.block_bitmap_location());
            mark_block(geometry, groups, gd.record_bitmap_location());
            let table = gd.record_table_location();
            for block in table..table.saturating_add(geometry.record_table_blocks()) {
                mark_block(geometry, groups, block);
            }
        }
    }

    fn mark_record_blocks(
        &self,
        geometry: &Geometry,
        groups: &mut [GroupBitmaps],
        number: u32,
        record: &FileRecord,
    ) {
        let xattr_block = ((record.file_acl_hi as u64) << 32) | record.file_acl_lo as u64;
        if xattr_block != 0 {
            mark_block(geometry, groups, xattr_block);
        }

        match record.block_map() {
            Ok(BlockMap::Direct(direct)) => {
                for block in direct {
                    mark_block(geometry, groups, block);
                }
            }
            // Indirect slots count as single blocks; their contents are not expanded
            Ok(BlockMap::Indirect {
                direct,
                single,
                double,
                triple,
            }) => {
                for block in direct.into_iter().chain([single, double, triple]) {
                    if block != 0 {
                        mark_block(geometry, groups, block);
                    }
                }
            }
            Ok(BlockMap::ExtentLeaf(extents)) => {
                for extent in extents {
                    let start = extent.physical_start();
                    for block in start..start + extent.len() as u64 {
                        mark_block(geometry, groups, block);
                    }
                }
            }
            Ok(BlockMap::ExtentInternal(indexes)) => {
                for index in indexes {
                    mark_block(geometry, groups, index.leaf());
                }
            }
            Ok(BlockMap::Inline) => {}
            Err(e) => debug!("Record {} has an unreadable block map: {}", number, e),
        }
    }
}

fn mark_block(geometry: &Geometry, groups: &mut [GroupBitmaps], block: u64) {
    if block >= geometry.total_blocks {
        return;
    }
    if let Some((group, bit)) = geometry.block_location(block) {
        if let Some(g) = groups.get_mut(group as usize) {
            set_bit(&mut g.block_bitmap, bit);
        }
    }
}

impl RebuiltBitmaps {
    pub fn used_blocks(&self) -> u64 {
        self.groups.iter().map(|g| g.used_blocks() as u64).sum()
    }

    pub fn used_records(&self) -> u64 {
        self.groups.iter().map(|g| g.used_records() as u64).sum()
    }

    /// Compare against the bitmaps currently on disk
    pub fn compare(&self, device: &BlockDevice) -> Vec<BitmapDelta> {
        self.groups
            .iter()
            .map(|g| {
                let on_disk = |location: u64, len: usize| {
                    self.byte_offset(location)
                        .and_then(|offset| device.read_bytes(offset, len).ok())
                        .map(|b| b.to_vec())
                        .unwrap_or_else(|| vec![0u8; len])
                };
                let blocks = on_disk(g.block_bitmap_location, g.block_bitmap.len());
                let records = on_disk(g.record_bitmap_location, g.record_bitmap.len());
                BitmapDelta {
                    group: g.group,
                    block_bits_changed: bits_differ(&blocks, &g.block_bitmap),
                    record_bits_changed: bits_differ(&records, &g.record_bitmap),
                }
            })
            .collect()
    }

    /// Byte offset of a block location, `None` when it overflows
    fn byte_offset(&self, location: u64) -> Option<u64> {
        location.checked_mul(self.block_size as u64)
    }

    fn regions(&self) -> impl Iterator<Item = (String, Option<u64>, &[u8])> + '_ {
        self.groups.iter().flat_map(move |g| {
            [
                (
                    format!("block-bitmap-{}", g.group),
                    self.byte_offset(g.block_bitmap_location),
                    g.block_bitmap.as_slice(),
                ),
                (
                    format!("record-bitmap-{}", g.group),
                    self.byte_offset(g.record_bitmap_location),
                    g.record_bitmap.as_slice(),
                ),
            ]
        })
    }

    /// Write the bitmaps over their on-disk regions. Every region is backed up
    /// through `store` before the first byte is modified. Regions at block 0
    /// or at an unaddressable location are skipped.
    pub fn write_back(&self, device: &mut BlockDevice, store: &mut dyn BackupStore) -> Result<usize> {
        let targets: Vec<(String, u64, &[u8])> = self
            .regions()
            .filter_map(|(label, offset, data)| match offset {
                Some(offset) if offset != 0 => Some((label, offset, data)),
                Some(_) => {
                    warn!("⚠️ Skipping {}: no on-disk location", label);
                    None
                }
                None => {
                    warn!("⚠️ Skipping {}: location overflows the byte range", label);
                    None
                }
            })
            .collect();

        for (label, offset, data) in &targets {
            let original = device.read_bytes(*offset, data.len())?.to_vec();
            store.save(label, *offset, &original)?;
        }

        for (_, offset, data) in &targets {
            device.write_bytes(*offset, data)?;
        }
        device.flush()?;

        info!("💾 Wrote {} bitmap regions", targets.len());
        Ok(targets.len())
    }
}
