/// Extent tree nodes as embedded in a record's block area or an index block
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{RecoveryError, Result};

pub const EXTENT_MAGIC: u16 = 0xF30A;
const HEADER_SIZE: usize = 12;
const ENTRY_SIZE: usize = 12;

/// Lengths above this mark an uninitialized (preallocated) extent
pub const MAX_INIT_LEN: u16 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max: u16,
    pub depth: u16,
    pub generation: u32,
}

impl ExtentHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(RecoveryError::invalid("extent header needs 12 bytes"));
        }

        let mut cursor = Cursor::new(data);
        let header = ExtentHeader {
            magic: cursor.read_u16::<LittleEndian>()?,
            entries: cursor.read_u16::<LittleEndian>()?,
            max: cursor.read_u16::<LittleEndian>()?,
            depth: cursor.read_u16::<LittleEndian>()?,
            generation: cursor.read_u32::<LittleEndian>()?,
        };

        if header.magic != EXTENT_MAGIC {
            return Err(RecoveryError::invalid(format!(
                "bad extent magic 0x{:04X}",
                header.magic
            )));
        }
        Ok(header)
    }

    fn write(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u16::<LittleEndian>(self.magic)?;
        buf.write_u16::<LittleEndian>(self.entries)?;
        buf.write_u16::<LittleEndian>(self.max)?;
        buf.write_u16::<LittleEndian>(self.depth)?;
        buf.write_u32::<LittleEndian>(self.generation)
    }
}

/// Leaf entry mapping a logical run onto physical blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub logical_block: u32,
    pub raw_len: u16,
    pub start_hi: u16,
    pub start_lo: u32,
}

impl Extent {
    pub fn new(logical_block: u32, len: u16, physical_start: u64) -> Self {
        Extent {
            logical_block,
            raw_len: len,
            start_hi: (physical_start >> 32) as u16,
            start_lo: physical_start as u32,
        }
    }

    pub fn is_uninitialized(&self) -> bool {
        self.raw_len > MAX_INIT_LEN
    }

    /// Block count with the uninitialized marker removed
    pub fn len(&self) -> u32 {
        if self.is_uninitialized() {
            (self.raw_len - MAX_INIT_LEN) as u32
        } else {
            self.raw_len as u32
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn physical_start(&self) -> u64 {
        ((self.start_hi as u64) << 32) | self.start_lo as u64
    }

    fn read(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Extent {
            logical_block: cursor.read_u32::<LittleEndian>()?,
            raw_len: cursor.read_u16::<LittleEndian>()?,
            start_hi: cursor.read_u16::<LittleEndian>()?,
            start_lo: cursor.read_u32::<LittleEndian>()?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u32::<LittleEndian>(self.logical_block)?;
        buf.write_u16::<LittleEndian>(self.raw_len)?;
        buf.write_u16::<LittleEndian>(self.start_hi)?;
        buf.write_u32::<LittleEndian>(self.start_lo)
    }
}

/// Internal-node entry pointing at a lower tree level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIndex {
    pub logical_block: u32,
    pub leaf_lo: u32,
    pub leaf_hi: u16,
    pub unused: u16,
}

impl ExtentIndex {
    pub fn new(logical_block: u32, leaf: u64) -> Self {
        ExtentIndex {
            logical_block,
            leaf_lo: leaf as u32,
            leaf_hi: (leaf >> 32) as u16,
            unused: 0,
        }
    }

    pub fn leaf(&self) -> u64 {
        ((self.leaf_hi as u64) << 32) | self.leaf_lo as u64
    }

    fn read(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(ExtentIndex {
            logical_block: cursor.read_u32::<LittleEndian>()?,
            leaf_lo: cursor.read_u32::<LittleEndian>()?,
            leaf_hi: cursor.read_u16::<LittleEndian>()?,
            unused: cursor.read_u16::<LittleEndian>()?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u32::<LittleEndian>(self.logical_block)?;
        buf.write_u32::<LittleEndian>(self.leaf_lo)?;
        buf.write_u16::<LittleEndian>(self.leaf_hi)?;
        buf.write_u16::<LittleEndian>(self.unused)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentEntries {
    Leaf(Vec<Extent>),
    Index(Vec<ExtentIndex>),
}

/// Header plus entries of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentNode {
    pub header: ExtentHeader,
    pub entries: ExtentEntries,
}

impl ExtentNode {
    /// Decode a node. Entries that would run past the buffer are dropped.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = ExtentHeader::parse(data)?;
        let fit = (data.len() - HEADER_SIZE) / ENTRY_SIZE;
        let count = (header.entries as usize).min(fit);

        let mut cursor = Cursor::new(data);
        cursor.set_position(HEADER_SIZE as u64);

        let entries = if header.depth == 0 {
            let mut extents = Vec::with_capacity(count);
            for _ in 0..count {
                extents.push(Extent::read(&mut cursor)?);
            }
            ExtentEntries::Leaf(extents)
        } else {
            let mut indexes = Vec::with_capacity(count);
            for _ in 0..count {
                indexes.push(ExtentIndex::read(&mut cursor)?);
            }
            ExtentEntries::Index(indexes)
        };

        Ok(ExtentNode { header, entries })
    }

    /// Leaf node with `max` slots (4 when embedded in a record)
    pub fn leaf(extents: Vec<Extent>, max: u16) -> Self {
        ExtentNode {
            header: ExtentHeader {
                magic: EXTENT_MAGIC,
                entries: extents.len() as u16,
                max,
                depth: 0,
                generation: 0,
            },
            entries: ExtentEntries::Leaf(extents),
        }
    }

    pub fn index(indexes: Vec<ExtentIndex>, max: u16, depth: u16) -> Self {
        ExtentNode {
            header: ExtentHeader {
                magic: EXTENT_MAGIC,
                entries: indexes.len() as u16,
                max,
                depth,
                generation: 0,
            },
            entries: ExtentEntries::Index(indexes),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + ENTRY_SIZE * self.header.max as usize);
        // Vec writes cannot fail
        let _ = self.write(&mut buf);
        buf
    }

    fn write(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        self.header.write(buf)?;
        match &self.entries {
            ExtentEntries::Leaf(extents) => {
                for extent in extents {
                    extent.write(buf)?;
                }
            }
            ExtentEntries::Index(indexes) => {
                for index in indexes {
                    index.write(buf)?;
                }
            }
        }
        Ok(())
    }
}
