/// Common types and utilities for image access
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind};
use std::path::Path;

use crate::error::{RecoveryError, Result};

enum Storage {
    Mapped(Mmap),
    Writable(MmapMut),
    Memory(Vec<u8>),
}

/// Byte-range accessor over a disk image or block device.
///
/// This is the only type in the crate that touches raw storage. Files are
/// memory-mapped; tests and callers holding an image in memory can wrap a
/// plain buffer instead.
pub struct BlockDevice {
    _file: Option<File>,
    storage: Storage,
}

impl BlockDevice {
    /// Open an image file read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();

        // Zero-length files cannot be mapped on every platform
        if size == 0 {
            return Ok(Self::from_bytes(Vec::new()));
        }

        let mmap = unsafe { MmapOptions::new().map(&file)? };

        Ok(BlockDevice {
            _file: Some(file),
            storage: Storage::Mapped(mmap),
        })
    }

    /// Open an image file for in-place repair
    pub fn open_writable<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();

        if size == 0 {
            return Err(IoError::new(ErrorKind::InvalidInput, "cannot repair an empty image").into());
        }

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok(BlockDevice {
            _file: Some(file),
            storage: Storage::Writable(mmap),
        })
    }

    /// Wrap an in-memory image. The buffer is writable.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        BlockDevice {
            _file: None,
            storage: Storage::Memory(data),
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Mapped(m) => &m[..],
            Storage::Writable(m) => &m[..],
            Storage::Memory(v) => &v[..],
        }
    }

    /// Get the size of the device in bytes
    pub fn size(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self.storage, Storage::Mapped(_))
    }

    /// Whole image contents
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes()
    }

    /// Read a slice of bytes from the device
    pub fn read_bytes(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let data = self.bytes();
        let end = offset
            .checked_add(length as u64)
            .filter(|&end| end <= data.len() as u64)
            .ok_or_else(|| {
                RecoveryError::IoFailure(IoError::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "read of {} bytes at offset {} beyond end of device ({} bytes)",
                        length,
                        offset,
                        data.len()
                    ),
                ))
            })?;

        Ok(&data[offset as usize..end as usize])
    }

    /// Read data at a specific block offset
    pub fn read_block(&self, block_number: u64, block_size: u32) -> Result<&[u8]> {
        let offset = block_number
            .checked_mul(block_size as u64)
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "block offset overflow"))?;
        self.read_bytes(offset, block_size as usize)
    }

    /// Read `count` consecutive blocks
    pub fn read_blocks(&self, start_block: u64, count: u64, block_size: u32) -> Result<&[u8]> {
        let offset = start_block
            .checked_mul(block_size as u64)
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "block offset overflow"))?;
        let length = count
            .checked_mul(block_size as u64)
            .and_then(|l| usize::try_from(l).ok())
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "block range too large"))?;
        self.read_bytes(offset, length)
    }

    /// Overwrite bytes in place
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.size();
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= size)
            .ok_or_else(|| {
                IoError::new(
                    ErrorKind::UnexpectedEof,
                    format!("write of {} bytes at offset {} beyond end of device", data.len(), offset),
                )
            })?;

        let target = match &mut self.storage {
            Storage::Mapped(_) => {
                return Err(IoError::new(ErrorKind::PermissionDenied, "device opened read-only").into())
            }
            Storage::Writable(m) => &mut m[offset as usize..end as usize],
            Storage::Memory(v) => &mut v[offset as usize..end as usize],
        };
        target.copy_from_slice(data);
        Ok(())
    }

    /// Persist pending writes of a mapped image
    pub fn flush(&self) -> Result<()> {
        if let Storage::Writable(m) = &self.storage {
            m.flush()?;
        }
        Ok(())
    }
}

/// Contiguous run of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub count: u64,
}

impl BlockRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.start && block < self.end()
    }

    pub fn iter(&self) -> std::ops::Range<u64> {
        self.start..self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_bounds() {
        let device = BlockDevice::from_bytes((0..=255u8).collect());
        assert_eq!(device.size(), 256);
        assert_eq!(device.read_bytes(10, 3).unwrap(), &[10, 11, 12]);
        assert!(device.read_bytes(250, 10).unwrap_err().is_io());
        assert!(device.read_bytes(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_read_block() {
        let device = BlockDevice::from_bytes(vec![7u8; 4096]);
        assert_eq!(device.read_block(3, 1024).unwrap().len(), 1024);
        assert!(device.read_block(4, 1024).is_err());
        assert_eq!(device.read_blocks(1, 2, 1024).unwrap().len(), 2048);
    }

    #[test]
    fn test_read_only_file_rejects_writes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 2048]).unwrap();
        tmp.flush().unwrap();

        let mut device = BlockDevice::open(tmp.path()).unwrap();
        assert!(!device.is_writable());
        assert_eq!(device.read_bytes(1024, 4).unwrap(), &[1, 1, 1, 1]);
        assert!(device.write_bytes(0, &[0]).unwrap_err().is_io());
    }

    #[test]
    fn test_writable_file_persists() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 1024]).unwrap();
        tmp.flush().unwrap();

        {
            let mut device = BlockDevice::open_writable(tmp.path()).unwrap();
            device.write_bytes(100, b"ext4").unwrap();
            device.flush().unwrap();
        }

        let contents = std::fs::read(tmp.path()).unwrap();
        assert_eq!(&contents[100..104], b"ext4");
    }

    #[test]
    fn test_block_range() {
        let range = BlockRange::new(10, 5);
        assert_eq!(range.end(), 15);
        assert!(range.contains(12));
        assert!(!range.contains(15));
        assert!(!range.contains(9));
        assert_eq!(range.iter().count(), 5);
    }
}
