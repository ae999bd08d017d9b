/// ext4 superblock (volume descriptor) codec
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};
use uuid::Uuid;

use super::{
    COMPAT_RESIZE_INODE, EXT4_MAGIC, INCOMPAT_64BIT, INCOMPAT_EXTENTS, INCOMPAT_FILETYPE,
    INCOMPAT_FLEX_BG, RO_COMPAT_SPARSE_SUPER, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use crate::error::{RecoveryError, Result};

/// Smallest group-descriptor entry when the 64-bit feature is active
const MIN_WIDE_DESC_SIZE: u32 = 64;
const LEGACY_DESC_SIZE: u32 = 32;
const GOOD_OLD_INODE_SIZE: u32 = 128;

/// Decoded ext4 superblock.
///
/// Only decoded through [`Descriptor::parse`], which rejects a bad magic, so a
/// value of this type is always a valid descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub inodes_count: u32,
    pub blocks_count_lo: u32,
    pub r_blocks_count_lo: u32,
    pub free_blocks_count_lo: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    #[serde(with = "serde_bytes64")]
    pub last_mounted: [u8; 64],
    pub algorithm_usage_bitmap: u32,
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,
    pub reserved_gdt_blocks: u16,
    pub journal_uuid: [u8; 16],
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub last_orphan: u32,
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
    pub jnl_backup_type: u8,
    pub desc_size: u16,
    pub default_mount_opts: u32,
    pub first_meta_bg: u32,
    pub mkfs_time: u32,
    pub jnl_blocks: [u32; 17],
    pub blocks_count_hi: u32,
    pub r_blocks_count_hi: u32,
    pub free_blocks_count_hi: u32,
    pub min_extra_isize: u16,
    pub want_extra_isize: u16,
    pub flags: u32,
    pub checksum: u32,
}

// serde only derives arrays up to 32 elements
mod serde_bytes64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 64], D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor {
            inodes_count: 0,
            blocks_count_lo: 0,
            r_blocks_count_lo: 0,
            free_blocks_count_lo: 0,
            free_inodes_count: 0,
            first_data_block: 0,
            log_block_size: 0,
            log_cluster_size: 0,
            blocks_per_group: 0,
            clusters_per_group: 0,
            inodes_per_group: 0,
            mtime: 0,
            wtime: 0,
            mnt_count: 0,
            max_mnt_count: 0,
            magic: EXT4_MAGIC,
            state: 0,
            errors: 0,
            minor_rev_level: 0,
            lastcheck: 0,
            checkinterval: 0,
            creator_os: 0,
            rev_level: 1,
            def_resuid: 0,
            def_resgid: 0,
            first_ino: 11,
            inode_size: 256,
            block_group_nr: 0,
            feature_compat: 0,
            feature_incompat: 0,
            feature_ro_compat: 0,
            uuid: [0; 16],
            volume_name: [0; 16],
            last_mounted: [0; 64],
            algorithm_usage_bitmap: 0,
            prealloc_blocks: 0,
            prealloc_dir_blocks: 0,
            reserved_gdt_blocks: 0,
            journal_uuid: [0; 16],
            journal_inum: 0,
            journal_dev: 0,
            last_orphan: 0,
            hash_seed: [0; 4],
            def_hash_version: 0,
            jnl_backup_type: 0,
            desc_size: 0,
            default_mount_opts: 0,
            first_meta_bg: 0,
            mkfs_time: 0,
            jnl_blocks: [0; 17],
            blocks_count_hi: 0,
            r_blocks_count_hi: 0,
            free_blocks_count_hi: 0,
            min_extra_isize: 0,
            want_extra_isize: 0,
            flags: 0,
            checksum: 0,
        }
    }
}

impl Descriptor {
    /// Decode a superblock from raw bytes, rejecting a bad magic
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(RecoveryError::invalid(format!(
                "superblock needs {} bytes, got {}",
                SUPERBLOCK_SIZE,
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let mut sb = Descriptor {
            inodes_count: cursor.read_u32::<LittleEndian>()?,
            blocks_count_lo: cursor.read_u32::<LittleEndian>()?,
            r_blocks_count_lo: cursor.read_u32::<LittleEndian>()?,
            free_blocks_count_lo: cursor.read_u32::<LittleEndian>()?,
            free_inodes_count: cursor.read_u32::<LittleEndian>()?,
            first_data_block: cursor.read_u32::<LittleEndian>()?,
            log_block_size: cursor.read_u32::<LittleEndian>()?,
            log_cluster_size: cursor.read_u32::<LittleEndian>()?,
            blocks_per_group: cursor.read_u32::<LittleEndian>()?,
            clusters_per_group: cursor.read_u32::<LittleEndian>()?,
            inodes_per_group: cursor.read_u32::<LittleEndian>()?,
            mtime: cursor.read_u32::<LittleEndian>()?,
            wtime: cursor.read_u32::<LittleEndian>()?,
            mnt_count: cursor.read_u16::<LittleEndian>()?,
            max_mnt_count: cursor.read_u16::<LittleEndian>()?,
            magic: cursor.read_u16::<LittleEndian>()?,
            ..Default::default()
        };

        if sb.magic != EXT4_MAGIC {
            return Err(RecoveryError::invalid(format!(
                "bad superblock magic 0x{:04X}",
                sb.magic
            )));
        }

        sb.state = cursor.read_u16::<LittleEndian>()?;
        sb.errors = cursor.read_u16::<LittleEndian>()?;
        sb.minor_rev_level = cursor.read_u16::<LittleEndian>()?;
        sb.lastcheck = cursor.read_u32::<LittleEndian>()?;
        sb.checkinterval = cursor.read_u32::<LittleEndian>()?;
        sb.creator_os = cursor.read_u32::<LittleEndian>()?;
        sb.rev_level = cursor.read_u32::<LittleEndian>()?;
        sb.def_resuid = cursor.read_u16::<LittleEndian>()?;
        sb.def_resgid = cursor.read_u16::<LittleEndian>()?;

        // Dynamic revision fields
        sb.first_ino = cursor.read_u32::<LittleEndian>()?;
        sb.inode_size = cursor.read_u16::<LittleEndian>()?;
        sb.block_group_nr = cursor.read_u16::<LittleEndian>()?;
        sb.feature_compat = cursor.read_u32::<LittleEndian>()?;
        sb.feature_incompat = cursor.read_u32::<LittleEndian>()?;
        sb.feature_ro_compat = cursor.read_u32::<LittleEndian>()?;
        cursor.read_exact(&mut sb.uuid)?;
        cursor.read_exact(&mut sb.volume_name)?;
        cursor.read_exact(&mut sb.last_mounted)?;
        sb.algorithm_usage_bitmap = cursor.read_u32::<LittleEndian>()?;
        sb.prealloc_blocks = cursor.read_u8()?;
        sb.prealloc_dir_blocks = cursor.read_u8()?;
        sb.reserved_gdt_blocks = cursor.read_u16::<LittleEndian>()?;

        // Journal
        cursor.read_exact(&mut sb.journal_uuid)?;
        sb.journal_inum = cursor.read_u32::<LittleEndian>()?;
        sb.journal_dev = cursor.read_u32::<LittleEndian>()?;
        sb.last_orphan = cursor.read_u32::<LittleEndian>()?;
        cursor.read_u32_into::<LittleEndian>(&mut sb.hash_seed)?;
        sb.def_hash_version = cursor.read_u8()?;
        sb.jnl_backup_type = cursor.read_u8()?;
        sb.desc_size = cursor.read_u16::<LittleEndian>()?;
        sb.default_mount_opts = cursor.read_u32::<LittleEndian>()?;
        sb.first_meta_bg = cursor.read_u32::<LittleEndian>()?;
        sb.mkfs_time = cursor.read_u32::<LittleEndian>()?;
        cursor.read_u32_into::<LittleEndian>(&mut sb.jnl_blocks)?;

        // 64-bit support
        sb.blocks_count_hi = cursor.read_u32::<LittleEndian>()?;
        sb.r_blocks_count_hi = cursor.read_u32::<LittleEndian>()?;
        sb.free_blocks_count_hi = cursor.read_u32::<LittleEndian>()?;
        sb.min_extra_isize = cursor.read_u16::<LittleEndian>()?;
        sb.want_extra_isize = cursor.read_u16::<LittleEndian>()?;
        sb.flags = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(1020);
        sb.checksum = cursor.read_u32::<LittleEndian>()?;

        Ok(sb)
    }

    /// Encode into a 1024-byte superblock image. Fields this codec does not
    /// model are written as zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut cursor = Cursor::new(vec![0u8; SUPERBLOCK_SIZE]);
        // Writes into a pre-sized in-memory buffer cannot fail
        let _ = self.write_fields(&mut cursor);
        cursor.into_inner()
    }

    fn write_fields(&self, c: &mut Cursor<Vec<u8>>) -> std::io::Result<()> {
        c.write_u32::<LittleEndian>(self.inodes_count)?;
        c.write_u32::<LittleEndian>(self.blocks_count_lo)?;
        c.write_u32::<LittleEndian>(self.r_blocks_count_lo)?;
        c.write_u32::<LittleEndian>(self.free_blocks_count_lo)?;
        c.write_u32::<LittleEndian>(self.free_inodes_count)?;
        c.write_u32::<LittleEndian>(self.first_data_block)?;
        c.write_u32::<LittleEndian>(self.log_block_size)?;
        c.write_u32::<LittleEndian>(self.log_cluster_size)?;
        c.write_u32::<LittleEndian>(self.blocks_per_group)?;
        c.write_u32::<LittleEndian>(self.clusters_per_group)?;
        c.write_u32::<LittleEndian>(self.inodes_per_group)?;
        c.write_u32::<LittleEndian>(self.mtime)?;
        c.write_u32::<LittleEndian>(self.wtime)?;
        c.write_u16::<LittleEndian>(self.mnt_count)?;
        c.write_u16::<LittleEndian>(self.max_mnt_count)?;
        c.write_u16::<LittleEndian>(self.magic)?;
        c.write_u16::<LittleEndian>(self.state)?;
        c.write_u16::<LittleEndian>(self.errors)?;
        c.write_u16::<LittleEndian>(self.minor_rev_level)?;
        c.write_u32::<LittleEndian>(self.lastcheck)?;
        c.write_u32::<LittleEndian>(self.checkinterval)?;
        c.write_u32::<LittleEndian>(self.creator_os)?;
        c.write_u32::<LittleEndian>(self.rev_level)?;
        c.write_u16::<LittleEndian>(self.def_resuid)?;
        c.write_u16::<LittleEndian>(self.def_resgid)?;
        c.write_u32::<LittleEndian>(self.first_ino)?;
        c.write_u16::<LittleEndian>(self.inode_size)?;
        c.write_u16::<LittleEndian>(self.block_group_nr)?;
        c.write_u32::<LittleEndian>(self.feature_compat)?;
        c.write_u32::<LittleEndian>(self.feature_incompat)?;
        c.write_u32::<LittleEndian>(self.feature_ro_compat)?;
        c.write_all(&self.uuid)?;
        c.write_all(&self.volume_name)?;
        c.write_all(&self.last_mounted)?;
        c.write_u32::<LittleEndian>(self.algorithm_usage_bitmap)?;
        c.write_u8(self.prealloc_blocks)?;
        c.write_u8(self.prealloc_dir_blocks)?;
        c.write_u16::<LittleEndian>(self.reserved_gdt_blocks)?;
        c.write_all(&self.journal_uuid)?;
        c.write_u32::<LittleEndian>(self.journal_inum)?;
        c.write_u32::<LittleEndian>(self.journal_dev)?;
        c.write_u32::<LittleEndian>(self.last_orphan)?;
        for seed in self.hash_seed {
            c.write_u32::<LittleEndian>(seed)?;
        }
        c.write_u8(self.def_hash_version)?;
        c.write_u8(self.jnl_backup_type)?;
        c.write_u16::<LittleEndian>(self.desc_size)?;
        c.write_u32::<LittleEndian>(self.default_mount_opts)?;
        c.write_u32::<LittleEndian>(self.first_meta_bg)?;
        c.write_u32::<LittleEndian>(self.mkfs_time)?;
        for block in self.jnl_blocks {
            c.write_u32::<LittleEndian>(block)?;
        }
        c.write_u32::<LittleEndian>(self.blocks_count_hi)?;
        c.write_u32::<LittleEndian>(self.r_blocks_count_hi)?;
        c.write_u32::<LittleEndian>(self.free_blocks_count_hi)?;
        c.write_u16::<LittleEndian>(self.min_extra_isize)?;
        c.write_u16::<LittleEndian>(self.want_extra_isize)?;
        c.write_u32::<LittleEndian>(self.flags)?;
        c.set_position(1020);
        c.write_u32::<LittleEndian>(self.checksum)?;
        Ok(())
    }

    /// Block size in bytes, `1024 << log_block_size` (0 if the exponent is absurd)
    pub fn block_size(&self) -> u64 {
        if self.log_block_size > 16 {
            return 0;
        }
        1024u64 << self.log_block_size
    }

    pub fn total_blocks(&self) -> u64 {
        ((self.blocks_count_hi as u64) << 32) | self.blocks_count_lo as u64
    }

    pub fn free_blocks(&self) -> u64 {
        ((self.free_blocks_count_hi as u64) << 32) | self.free_blocks_count_lo as u64
    }

    pub fn reserved_blocks(&self) -> u64 {
        ((self.r_blocks_count_hi as u64) << 32) | self.r_blocks_count_lo as u64
    }

    /// `ceil(total_blocks / blocks_per_group)`, 0 when blocks_per_group is 0
    pub fn group_count(&self) -> u64 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.total_blocks().div_ceil(self.blocks_per_group as u64)
    }

    pub fn is_wide(&self) -> bool {
        self.feature_incompat & INCOMPAT_64BIT != 0
    }

    pub fn has_extents(&self) -> bool {
        self.feature_incompat & INCOMPAT_EXTENTS != 0
    }

    pub fn has_flex_bg(&self) -> bool {
        self.feature_incompat & INCOMPAT_FLEX_BG != 0
    }

    pub fn has_filetype(&self) -> bool {
        self.feature_incompat & INCOMPAT_FILETYPE != 0
    }

    pub fn has_sparse_super(&self) -> bool {
        self.feature_ro_compat & RO_COMPAT_SPARSE_SUPER != 0
    }

    pub fn has_resize_inode(&self) -> bool {
        self.feature_compat & COMPAT_RESIZE_INODE != 0
    }

    /// Size of one group-descriptor entry
    pub fn group_desc_size(&self) -> u32 {
        if self.is_wide() {
            (self.desc_size as u32).max(MIN_WIDE_DESC_SIZE)
        } else {
            LEGACY_DESC_SIZE
        }
    }

    /// On-disk size of one inode record
    pub fn record_size(&self) -> u32 {
        if self.rev_level == 0 || self.inode_size == 0 {
            GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size as u32
        }
    }

    /// Block holding this superblock within its group (1 for 1 KiB blocks, else 0)
    pub fn descriptor_block(&self) -> u64 {
        match self.block_size() {
            0 => 0,
            bs => SUPERBLOCK_OFFSET as u64 / bs,
        }
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid)
    }

    pub fn volume_name(&self) -> String {
        c_string(&self.volume_name)
    }

    pub fn last_mounted(&self) -> String {
        c_string(&self.last_mounted)
    }

    pub fn mount_time(&self) -> Option<DateTime<Utc>> {
        unix_time(self.mtime)
    }

    pub fn write_time(&self) -> Option<DateTime<Utc>> {
        unix_time(self.wtime)
    }

    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        unix_time(self.mkfs_time)
    }

    /// Validated geometry used by every group/offset computation
    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::from_descriptor(self)
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn unix_time(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(secs as i64, 0)
}

/// Group/offset arithmetic derived from a descriptor.
///
/// Built once per session and shared by the resolver, walker, bitmap
/// rebuilder and carvers so no call site re-derives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub records_per_group: u32,
    pub record_size: u32,
    pub total_blocks: u64,
    pub total_records: u32,
    pub group_count: u32,
    pub first_data_block: u32,
    pub desc_size: u32,
    pub wide: bool,
}

impl Geometry {
    pub fn from_descriptor(sb: &Descriptor) -> Result<Self> {
        let block_size = sb.block_size();
        if !matches!(block_size, 1024 | 2048 | 4096) {
            return Err(RecoveryError::invalid(format!(
                "unsupported block size {} (log {})",
                block_size, sb.log_block_size
            )));
        }
        if sb.blocks_per_group == 0 {
            return Err(RecoveryError::invalid("blocks per group is zero"));
        }
        if sb.inodes_per_group == 0 {
            return Err(RecoveryError::invalid("inodes per group is zero"));
        }
        let group_count = u32::try_from(sb.group_count())
            .map_err(|_| RecoveryError::invalid("group count exceeds 32 bits"))?;

        Ok(Geometry {
            block_size: block_size as u32,
            blocks_per_group: sb.blocks_per_group,
            records_per_group: sb.inodes_per_group,
            record_size: sb.record_size(),
            total_blocks: sb.total_blocks(),
            total_records: sb.inodes_count,
            group_count,
            first_data_block: sb.first_data_block,
            desc_size: sb.group_desc_size(),
            wide: sb.is_wide(),
        })
    }

    /// `(group, local_index)` of a record number, `divmod(number - 1, records_per_group)`
    pub fn record_location(&self, number: u32) -> Option<(u32, u32)> {
        let zero_based = number.checked_sub(1)?;
        Some((
            zero_based / self.records_per_group,
            zero_based % self.records_per_group,
        ))
    }

    /// `(group, bit)` of an absolute block within the block bitmaps
    pub fn block_location(&self, block: u64) -> Option<(u32, u32)> {
        let relative = block.checked_sub(self.first_data_block as u64)?;
        let group = relative / self.blocks_per_group as u64;
        let bit = relative % self.blocks_per_group as u64;
        Some((u32::try_from(group).ok()?, bit as u32))
    }

    /// First absolute block of a group
    pub fn group_first_block(&self, group: u32) -> u64 {
        self.first_data_block as u64 + group as u64 * self.blocks_per_group as u64
    }

    /// Blocks needed for one group's record table
    pub fn record_table_blocks(&self) -> u64 {
        (self.records_per_group as u64 * self.record_size as u64).div_ceil(self.block_size as u64)
    }

    /// Blocks needed for the whole group-descriptor table
    pub fn group_table_blocks(&self) -> u64 {
        (self.group_count as u64 * self.desc_size as u64).div_ceil(self.block_size as u64)
    }

    /// Block holding the primary descriptor; the group table follows it
    pub fn descriptor_block(&self) -> u64 {
        SUPERBLOCK_OFFSET as u64 / self.block_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Descriptor {
        let mut sb = Descriptor {
            inodes_count: 2048,
            blocks_count_lo: 8192,
            r_blocks_count_lo: 409,
            free_blocks_count_lo: 7000,
            free_inodes_count: 2030,
            first_data_block: 1,
            log_block_size: 0,
            blocks_per_group: 8192,
            clusters_per_group: 8192,
            inodes_per_group: 2048,
            mtime: 1_700_000_000,
            wtime: 1_700_000_100,
            mnt_count: 3,
            max_mnt_count: 0xFFFF,
            state: 1,
            errors: 1,
            creator_os: 0,
            rev_level: 1,
            first_ino: 11,
            inode_size: 256,
            block_group_nr: 0,
            feature_compat: 0x38,
            feature_incompat: INCOMPAT_FILETYPE | INCOMPAT_EXTENTS,
            feature_ro_compat: RO_COMPAT_SPARSE_SUPER,
            reserved_gdt_blocks: 31,
            journal_inum: 8,
            hash_seed: [1, 2, 3, 4],
            def_hash_version: 1,
            desc_size: 0,
            mkfs_time: 1_690_000_000,
            blocks_count_hi: 0,
            min_extra_isize: 32,
            want_extra_isize: 32,
            flags: 1,
            checksum: 0xDEADBEEF,
            ..Default::default()
        };
        sb.uuid = *b"0123456789abcdef";
        sb.volume_name[..6].copy_from_slice(b"rescue");
        sb.last_mounted[..4].copy_from_slice(b"/mnt");
        sb.jnl_blocks[16] = 4096;
        sb
    }

    #[test]
    fn test_superblock_round_trip() {
        let sb = sample();
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        assert_eq!(&bytes[56..58], &[0x53, 0xEF]);

        let decoded = Descriptor::parse(&bytes).unwrap();
        assert_eq!(decoded, sb);
        assert_eq!(decoded.volume_name(), "rescue");
        assert_eq!(decoded.last_mounted(), "/mnt");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[56] = 0;
        assert!(matches!(
            Descriptor::parse(&bytes),
            Err(RecoveryError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            Descriptor::parse(&bytes[..512]),
            Err(RecoveryError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_split_fields_combine() {
        let sb = Descriptor {
            blocks_count_lo: 5,
            blocks_count_hi: 1,
            free_blocks_count_lo: 2,
            free_blocks_count_hi: 3,
            ..Default::default()
        };
        assert_eq!(sb.total_blocks(), (1u64 << 32) | 5);
        assert_eq!(sb.free_blocks(), (3u64 << 32) | 2);
    }

    #[test]
    fn test_desc_size_rules() {
        let mut sb = sample();
        assert_eq!(sb.group_desc_size(), 32);
        sb.feature_incompat |= INCOMPAT_64BIT;
        sb.desc_size = 64;
        assert_eq!(sb.group_desc_size(), 64);
        sb.desc_size = 0;
        assert_eq!(sb.group_desc_size(), 64);
    }

    #[test]
    fn test_geometry() {
        let geo = sample().geometry().unwrap();
        assert_eq!(geo.block_size, 1024);
        assert_eq!(geo.group_count, 1);
        assert_eq!(geo.descriptor_block(), 1);
        assert_eq!(geo.record_table_blocks(), 512);
        assert_eq!(geo.record_location(1), Some((0, 0)));
        assert_eq!(geo.record_location(2048), Some((0, 2047)));
        assert_eq!(geo.record_location(0), None);
        assert_eq!(geo.block_location(1), Some((0, 0)));
        assert_eq!(geo.block_location(0), None);
    }

    #[test]
    fn test_geometry_rejects_large_blocks() {
        let sb = Descriptor {
            log_block_size: 4,
            blocks_per_group: 8192,
            inodes_per_group: 128,
            ..Default::default()
        };
        assert!(sb.geometry().is_err());
    }

    #[test]
    fn test_record_arithmetic_bounds() {
        for per_group in [1u32, 7, 128, 8192] {
            let groups = 5u32;
            let sb = Descriptor {
                log_block_size: 2,
                blocks_per_group: 32768,
                blocks_count_lo: 32768 * groups,
                inodes_per_group: per_group,
                inodes_count: per_group * groups,
                ..Default::default()
            };
            let geo = sb.geometry().unwrap();
            for n in [1, per_group, per_group * groups / 2 + 1, per_group * groups] {
                let (group, index) = geo.record_location(n).unwrap();
                assert_eq!(group, (n - 1) / per_group);
                assert_eq!(index, (n - 1) % per_group);
                assert!(index < per_group);
                assert!(group < groups);
            }
        }
    }
}
