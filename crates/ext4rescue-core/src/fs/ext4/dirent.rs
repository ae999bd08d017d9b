/// Directory entries (`ext4_dir_entry_2`) and the block scanner
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{RecoveryError, Result};

pub const ENTRY_HEADER_SIZE: usize = 8;
const RESYNC_STEP: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    Unknown,
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl EntryType {
    /// Map an on-disk type tag; tags above 7 are not valid
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => EntryType::Unknown,
            1 => EntryType::File,
            2 => EntryType::Directory,
            3 => EntryType::CharDevice,
            4 => EntryType::BlockDevice,
            5 => EntryType::Fifo,
            6 => EntryType::Socket,
            7 => EntryType::Symlink,
            _ => return None,
        })
    }

    pub fn tag(&self) -> u8 {
        match self {
            EntryType::Unknown => 0,
            EntryType::File => 1,
            EntryType::Directory => 2,
            EntryType::CharDevice => 3,
            EntryType::BlockDevice => 4,
            EntryType::Fifo => 5,
            EntryType::Socket => 6,
            EntryType::Symlink => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntryType::Unknown => "Unknown",
            EntryType::File => "File",
            EntryType::Directory => "Dir",
            EntryType::CharDevice => "CharDev",
            EntryType::BlockDevice => "BlockDev",
            EntryType::Fifo => "FIFO",
            EntryType::Socket => "Socket",
            EntryType::Symlink => "Symlink",
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One name → record number mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub number: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirectoryRecord {
    pub fn new(number: u32, name: &str, entry_type: EntryType) -> Self {
        let name = name.as_bytes()[..name.len().min(255)].to_vec();
        DirectoryRecord {
            number,
            rec_len: Self::min_len(name.len()) as u16,
            name_len: name.len() as u8,
            file_type: entry_type.tag(),
            name,
        }
    }

    /// Smallest 4-byte aligned record holding a name of `name_len` bytes
    pub fn min_len(name_len: usize) -> usize {
        (ENTRY_HEADER_SIZE + name_len + 3) & !3
    }

    /// Decode the fixed header and name at the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_HEADER_SIZE {
            return Err(RecoveryError::invalid("directory entry needs 8 bytes"));
        }

        let mut cursor = Cursor::new(data);
        let number = cursor.read_u32::<LittleEndian>()?;
        let rec_len = cursor.read_u16::<LittleEndian>()?;
        let name_len = cursor.read_u8()?;
        let file_type = cursor.read_u8()?;

        let name_end = ENTRY_HEADER_SIZE + name_len as usize;
        if data.len() < name_end {
            return Err(RecoveryError::invalid(format!(
                "directory entry name of {} bytes runs past the buffer",
                name_len
            )));
        }

        Ok(DirectoryRecord {
            number,
            rec_len,
            name_len,
            file_type,
            name: data[ENTRY_HEADER_SIZE..name_end].to_vec(),
        })
    }

    /// Encode, padded with zeros to `rec_len`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.rec_len as usize);
        // Vec writes cannot fail
        let _ = buf.write_u32::<LittleEndian>(self.number);
        let _ = buf.write_u16::<LittleEndian>(self.rec_len);
        buf.push(self.name_len);
        buf.push(self.file_type);
        buf.extend_from_slice(&self.name);
        if buf.len() < self.rec_len as usize {
            buf.resize(self.rec_len as usize, 0);
        }
        buf
    }

    /// Best-effort name, invalid sequences replaced
    pub fn name_lossy(&self) -> String {
        let (decoded, _) = encoding_rs::UTF_8.decode_without_bom_handling(&self.name);
        decoded.into_owned()
    }

    pub fn entry_type(&self) -> Option<EntryType> {
        EntryType::from_tag(self.file_type)
    }

    /// `.` or `..`
    pub fn is_dot_entry(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    Strict,
    Resync,
}

/// Lazy iterator over the entries packed in one directory block.
///
/// A clone continues from the same position. A fresh call to
/// [`decode_directory_block`] re-scans from the start and yields the same
/// sequence.
#[derive(Debug, Clone)]
pub struct DirectoryRecords<'a> {
    data: &'a [u8],
    pos: usize,
    mode: ScanMode,
}

/// Strict scan: a zero record number, zero length or overrun ends the block
pub fn decode_directory_block(data: &[u8]) -> DirectoryRecords<'_> {
    DirectoryRecords {
        data,
        pos: 0,
        mode: ScanMode::Strict,
    }
}

impl<'a> DirectoryRecords<'a> {
    /// Resynchronizing scan: a corrupt length advances 4 bytes and retries, an
    /// unused slot (record number 0) is stepped over by its length.
    pub fn resync(data: &'a [u8]) -> Self {
        DirectoryRecords {
            data,
            pos: 0,
            mode: ScanMode::Resync,
        }
    }

    /// Byte offset of the next candidate
    pub fn position(&self) -> usize {
        self.pos
    }

    fn length_is_sane(&self, record: &DirectoryRecord) -> bool {
        let rec_len = record.rec_len as usize;
        rec_len >= ENTRY_HEADER_SIZE + record.name_len as usize
            && rec_len % 4 == 0
            && self.pos + rec_len <= self.data.len()
    }
}

impl<'a> Iterator for DirectoryRecords<'a> {
    type Item = DirectoryRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos + ENTRY_HEADER_SIZE <= self.data.len() {
            let parsed = DirectoryRecord::parse(&self.data[self.pos..]);

            match self.mode {
                ScanMode::Strict => {
                    let record = parsed.ok()?;
                    if record.number == 0
                        || record.rec_len == 0
                        || !self.length_is_sane(&record)
                    {
                        self.pos = self.data.len();
                        return None;
                    }
                    self.pos += record.rec_len as usize;
                    return Some(record);
                }
                ScanMode::Resync => {
                    let record = match parsed {
                        Ok(r) if self.length_is_sane(&r) => r,
                        _ => {
                            self.pos += RESYNC_STEP;
                            continue;
                        }
                    };
                    self.pos += record.rec_len as usize;
                    if record.number == 0 {
                        continue;
                    }
                    return Some(record);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(entries: &[DirectoryRecord], size: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for entry in entries {
            data.extend_from_slice(&entry.to_bytes());
        }
        data.resize(size, 0);
        data
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = DirectoryRecord::new(12, "notes.txt", EntryType::File);
        assert_eq!(entry.rec_len, 20);
        let bytes = entry.to_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(DirectoryRecord::parse(&bytes).unwrap(), entry);
        assert_eq!(entry.name_lossy(), "notes.txt");
    }

    #[test]
    fn test_strict_scan_stops_at_zero() {
        let data = block(
            &[
                DirectoryRecord::new(2, ".", EntryType::Directory),
                DirectoryRecord::new(2, "..", EntryType::Directory),
                DirectoryRecord::new(11, "lost+found", EntryType::Directory),
            ],
            1024,
        );
        let names: Vec<_> = decode_directory_block(&data).map(|e| e.name_lossy()).collect();
        assert_eq!(names, vec![".", "..", "lost+found"]);

        // Re-scanning the same bytes yields the same sequence
        let again: Vec<_> = decode_directory_block(&data).collect();
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn test_last_entry_spans_block() {
        let mut last = DirectoryRecord::new(13, "a", EntryType::File);
        last.rec_len = 1024 - 12;
        let data = block(&[DirectoryRecord::new(2, ".", EntryType::Directory), last], 1024);
        assert_eq!(decode_directory_block(&data).count(), 2);
    }

    #[test]
    fn test_resync_skips_corrupt_length() {
        let mut corrupt = DirectoryRecord::new(5, "", EntryType::Unknown);
        corrupt.rec_len = 0;
        let mut data = DirectoryRecord::new(12, "first", EntryType::File).to_bytes();
        data.extend_from_slice(&corrupt.to_bytes()); // 8-byte header only
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&DirectoryRecord::new(14, "second", EntryType::File).to_bytes());
        data.resize(1024, 0);

        let strict: Vec<_> = decode_directory_block(&data).map(|e| e.number).collect();
        assert_eq!(strict, vec![12]);

        let resynced: Vec<_> = DirectoryRecords::resync(&data).map(|e| e.number).collect();
        assert_eq!(resynced, vec![12, 14]);
    }

    #[test]
    fn test_resync_steps_over_unused_slot() {
        let mut unused = DirectoryRecord::new(0, "gone", EntryType::File);
        unused.rec_len = 16;
        let data = block(
            &[unused, DirectoryRecord::new(20, "kept", EntryType::File)],
            64,
        );
        let numbers: Vec<_> = DirectoryRecords::resync(&data).map(|e| e.number).collect();
        assert_eq!(numbers, vec![20]);
        assert!(decode_directory_block(&data).next().is_none());
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let mut entry = DirectoryRecord::new(3, "ab", EntryType::File);
        entry.name = vec![b'a', 0xFF, b'b'];
        entry.name_len = 3;
        assert_eq!(entry.name_lossy(), "a\u{FFFD}b");
    }

    #[test]
    fn test_type_tags() {
        for tag in 0..=7u8 {
            assert_eq!(EntryType::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(EntryType::from_tag(8).is_none());
        assert_eq!(EntryType::Directory.to_string(), "Dir");
    }
}
