/// File records (inodes) and their block addressing
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::extent::{Extent, ExtentEntries, ExtentIndex, ExtentNode};
use super::{EXTENTS_FL, INLINE_DATA_FL};
use crate::error::{RecoveryError, Result};

/// Fixed core present in every record
pub const RECORD_CORE_SIZE: usize = 128;
pub const DIRECT_POINTERS: usize = 12;
pub const BLOCK_SLOTS: usize = 15;
const BLOCK_AREA_SIZE: usize = BLOCK_SLOTS * 4;

const S_IFMT: u16 = 0xF000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    Regular,
    Symlink,
    Socket,
    Unknown,
}

impl RecordKind {
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            0x1000 => RecordKind::Fifo,
            0x2000 => RecordKind::CharDevice,
            0x4000 => RecordKind::Directory,
            0x6000 => RecordKind::BlockDevice,
            0x8000 => RecordKind::Regular,
            0xA000 => RecordKind::Symlink,
            0xC000 => RecordKind::Socket,
            _ => RecordKind::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Fifo => "fifo",
            RecordKind::CharDevice => "character device",
            RecordKind::Directory => "directory",
            RecordKind::BlockDevice => "block device",
            RecordKind::Regular => "regular file",
            RecordKind::Symlink => "symlink",
            RecordKind::Socket => "socket",
            RecordKind::Unknown => "unknown",
        }
    }
}

/// How a record addresses its data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockMap {
    /// Direct pointers up to the first zero slot
    Direct(Vec<u64>),
    /// Direct pointers plus non-zero single/double/triple indirect slots
    Indirect {
        direct: Vec<u64>,
        single: u64,
        double: u64,
        triple: u64,
    },
    ExtentLeaf(Vec<Extent>),
    ExtentInternal(Vec<ExtentIndex>),
    /// Data lives in the record itself (fast symlink or inline data)
    Inline,
}

/// Decoded inode.
///
/// The extra fields after the 128-byte core are decoded only when the buffer
/// holds them; otherwise they stay zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub mode: u16,
    pub uid_lo: u16,
    pub size_lo: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid_lo: u16,
    pub links_count: u16,
    pub blocks_lo: u32,
    pub flags: u32,
    pub osd1: u32,
    pub block: [u32; BLOCK_SLOTS],
    pub generation: u32,
    pub file_acl_lo: u32,
    pub size_high: u32,
    pub obso_faddr: u32,
    pub blocks_hi: u16,
    pub file_acl_hi: u16,
    pub uid_hi: u16,
    pub gid_hi: u16,
    pub checksum_lo: u16,
    pub osd2_reserved: u16,
    pub extra_isize: u16,
    pub checksum_hi: u16,
    pub ctime_extra: u32,
    pub mtime_extra: u32,
    pub atime_extra: u32,
    pub crtime: u32,
    pub crtime_extra: u32,
    pub version_hi: u32,
    pub projid: u32,
}

impl FileRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_CORE_SIZE {
            return Err(RecoveryError::invalid(format!(
                "file record needs {} bytes, got {}",
                RECORD_CORE_SIZE,
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let mut record = FileRecord {
            mode: cursor.read_u16::<LittleEndian>()?,
            uid_lo: cursor.read_u16::<LittleEndian>()?,
            size_lo: cursor.read_u32::<LittleEndian>()?,
            atime: cursor.read_u32::<LittleEndian>()?,
            ctime: cursor.read_u32::<LittleEndian>()?,
            mtime: cursor.read_u32::<LittleEndian>()?,
            dtime: cursor.read_u32::<LittleEndian>()?,
            gid_lo: cursor.read_u16::<LittleEndian>()?,
            links_count: cursor.read_u16::<LittleEndian>()?,
            blocks_lo: cursor.read_u32::<LittleEndian>()?,
            flags: cursor.read_u32::<LittleEndian>()?,
            osd1: cursor.read_u32::<LittleEndian>()?,
            ..Default::default()
        };
        cursor.read_u32_into::<LittleEndian>(&mut record.block)?;
        record.generation = cursor.read_u32::<LittleEndian>()?;
        record.file_acl_lo = cursor.read_u32::<LittleEndian>()?;
        record.size_high = cursor.read_u32::<LittleEndian>()?;
        record.obso_faddr = cursor.read_u32::<LittleEndian>()?;

        // Linux osd2
        record.blocks_hi = cursor.read_u16::<LittleEndian>()?;
        record.file_acl_hi = cursor.read_u16::<LittleEndian>()?;
        record.uid_hi = cursor.read_u16::<LittleEndian>()?;
        record.gid_hi = cursor.read_u16::<LittleEndian>()?;
        record.checksum_lo = cursor.read_u16::<LittleEndian>()?;
        record.osd2_reserved = cursor.read_u16::<LittleEndian>()?;

        // Extra fields, each only if the buffer still holds it
        let extra = &data[RECORD_CORE_SIZE..];
        let mut extra_cursor = Cursor::new(extra);
        let remaining = |c: &Cursor<&[u8]>| extra.len() as u64 - c.position();

        if remaining(&extra_cursor) >= 2 {
            record.extra_isize = extra_cursor.read_u16::<LittleEndian>()?;
        }
        if remaining(&extra_cursor) >= 2 {
            record.checksum_hi = extra_cursor.read_u16::<LittleEndian>()?;
        }
        for field in [
            &mut record.ctime_extra,
            &mut record.mtime_extra,
            &mut record.atime_extra,
            &mut record.crtime,
            &mut record.crtime_extra,
            &mut record.version_hi,
            &mut record.projid,
        ] {
            if remaining(&extra_cursor) < 4 {
                break;
            }
            *field = extra_cursor.read_u32::<LittleEndian>()?;
        }

        Ok(record)
    }

    /// Encode into `record_size` bytes (at least the 128-byte core). Extra
    /// fields that do not fit are dropped.
    pub fn to_bytes(&self, record_size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(record_size.max(RECORD_CORE_SIZE) + 32);
        // Vec writes cannot fail
        let _ = self.write_fields(&mut buf);
        buf.resize(record_size.max(RECORD_CORE_SIZE), 0);
        buf
    }

    fn write_fields(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u16::<LittleEndian>(self.mode)?;
        buf.write_u16::<LittleEndian>(self.uid_lo)?;
        buf.write_u32::<LittleEndian>(self.size_lo)?;
        buf.write_u32::<LittleEndian>(self.atime)?;
        buf.write_u32::<LittleEndian>(self.ctime)?;
        buf.write_u32::<LittleEndian>(self.mtime)?;
        buf.write_u32::<LittleEndian>(self.dtime)?;
        buf.write_u16::<LittleEndian>(self.gid_lo)?;
        buf.write_u16::<LittleEndian>(self.links_count)?;
        buf.write_u32::<LittleEndian>(self.blocks_lo)?;
        buf.write_u32::<LittleEndian>(self.flags)?;
        buf.write_u32::<LittleEndian>(self.osd1)?;
        for slot in self.block {
            buf.write_u32::<LittleEndian>(slot)?;
        }
        buf.write_u32::<LittleEndian>(self.generation)?;
        buf.write_u32::<LittleEndian>(self.file_acl_lo)?;
        buf.write_u32::<LittleEndian>(self.size_high)?;
        buf.write_u32::<LittleEndian>(self.obso_faddr)?;
        buf.write_u16::<LittleEndian>(self.blocks_hi)?;
        buf.write_u16::<LittleEndian>(self.file_acl_hi)?;
        buf.write_u16::<LittleEndian>(self.uid_hi)?;
        buf.write_u16::<LittleEndian>(self.gid_hi)?;
        buf.write_u16::<LittleEndian>(self.checksum_lo)?;
        buf.write_u16::<LittleEndian>(self.osd2_reserved)?;
        buf.write_u16::<LittleEndian>(self.extra_isize)?;
        buf.write_u16::<LittleEndian>(self.checksum_hi)?;
        buf.write_u32::<LittleEndian>(self.ctime_extra)?;
        buf.write_u32::<LittleEndian>(self.mtime_extra)?;
        buf.write_u32::<LittleEndian>(self.atime_extra)?;
        buf.write_u32::<LittleEndian>(self.crtime)?;
        buf.write_u32::<LittleEndian>(self.crtime_extra)?;
        buf.write_u32::<LittleEndian>(self.version_hi)?;
        buf.write_u32::<LittleEndian>(self.projid)
    }

    /// A record is in use iff its mode is non-zero
    pub fn is_valid(&self) -> bool {
        self.mode != 0
    }

    pub fn kind(&self) -> RecordKind {
        RecordKind::from_mode(self.mode)
    }

    pub fn permissions(&self) -> u16 {
        self.mode & 0o7777
    }

    pub fn size(&self) -> u64 {
        ((self.size_high as u64) << 32) | self.size_lo as u64
    }

    pub fn set_size(&mut self, size: u64) {
        self.size_lo = size as u32;
        self.size_high = (size >> 32) as u32;
    }

    pub fn uid(&self) -> u32 {
        ((self.uid_hi as u32) << 16) | self.uid_lo as u32
    }

    pub fn gid(&self) -> u32 {
        ((self.gid_hi as u32) << 16) | self.gid_lo as u32
    }

    pub fn is_deleted(&self) -> bool {
        self.dtime != 0
    }

    pub fn uses_extents(&self) -> bool {
        self.flags & EXTENTS_FL != 0
    }

    pub fn has_inline_data(&self) -> bool {
        self.flags & INLINE_DATA_FL != 0
    }

    /// Symlink whose target is stored in the block area
    pub fn is_fast_symlink(&self) -> bool {
        self.kind() == RecordKind::Symlink
            && !self.uses_extents()
            && self.size() < BLOCK_AREA_SIZE as u64
    }

    /// The 60-byte block area as raw bytes
    pub fn block_bytes(&self) -> [u8; BLOCK_AREA_SIZE] {
        let mut bytes = [0u8; BLOCK_AREA_SIZE];
        for (chunk, slot) in bytes.chunks_exact_mut(4).zip(self.block) {
            chunk.copy_from_slice(&slot.to_le_bytes());
        }
        bytes
    }

    /// Overwrite the block area with raw bytes (e.g. an encoded extent node)
    pub fn set_block_bytes(&mut self, data: &[u8]) {
        let mut bytes = [0u8; BLOCK_AREA_SIZE];
        let len = data.len().min(BLOCK_AREA_SIZE);
        bytes[..len].copy_from_slice(&data[..len]);
        for (slot, chunk) in self.block.iter_mut().zip(bytes.chunks_exact(4)) {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    /// Non-zero direct pointers, up to the first zero slot
    pub fn direct_pointers(&self) -> Vec<u64> {
        self.block[..DIRECT_POINTERS]
            .iter()
            .take_while(|&&p| p != 0)
            .map(|&p| p as u64)
            .collect()
    }

    /// Decode the block area according to the record's flags
    pub fn block_map(&self) -> Result<BlockMap> {
        if self.has_inline_data() || self.is_fast_symlink() {
            return Ok(BlockMap::Inline);
        }

        if self.uses_extents() {
            let node = ExtentNode::parse(&self.block_bytes())?;
            return Ok(match node.entries {
                ExtentEntries::Leaf(extents) => BlockMap::ExtentLeaf(extents),
                ExtentEntries::Index(indexes) => BlockMap::ExtentInternal(indexes),
            });
        }

        let direct = self.direct_pointers();
        let [single, double, triple] = [
            self.block[12] as u64,
            self.block[13] as u64,
            self.block[14] as u64,
        ];
        if single == 0 && double == 0 && triple == 0 {
            Ok(BlockMap::Direct(direct))
        } else {
            Ok(BlockMap::Indirect {
                direct,
                single,
                double,
                triple,
            })
        }
    }

    pub fn accessed(&self) -> Option<DateTime<Utc>> {
        decode_time(self.atime, self.atime_extra)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        decode_time(self.mtime, self.mtime_extra)
    }

    pub fn changed(&self) -> Option<DateTime<Utc>> {
        decode_time(self.ctime, self.ctime_extra)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        decode_time(self.crtime, self.crtime_extra)
    }

    pub fn deleted(&self) -> Option<DateTime<Utc>> {
        decode_time(self.dtime, 0)
    }
}

/// Seconds plus the extra word: low 2 bits extend the epoch, the rest are nanoseconds
fn decode_time(seconds: u32, extra: u32) -> Option<DateTime<Utc>> {
    if seconds == 0 && extra == 0 {
        return None;
    }
    let epoch = (extra & 0x3) as i64;
    let nanos = extra >> 2;
    let secs = seconds as i32 as i64 + (epoch << 32);
    DateTime::from_timestamp(secs, nanos.min(999_999_999))
}
