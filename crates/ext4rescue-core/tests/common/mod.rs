//! Synthetic ext4 images for integration tests
#![allow(dead_code)]

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use ext4rescue_core::fs::ext4::{
    Descriptor, DirectoryRecord, EntryType, FileRecord, GroupDescriptor, INCOMPAT_FILETYPE,
};
use tempfile::NamedTempFile;

pub const BS: usize = 4096;
pub const BLOCKS_PER_GROUP: u32 = 32768;
pub const RECORDS_PER_GROUP: u32 = 32;
pub const RECORD_SIZE: usize = 256;

pub const BLOCK_BITMAP: u64 = 3;
pub const RECORD_BITMAP: u64 = 4;
pub const RECORD_TABLE: u64 = 5;

/// One-group volume with 4 KiB blocks
pub fn descriptor(total_blocks: u32) -> Descriptor {
    Descriptor {
        inodes_count: RECORDS_PER_GROUP,
        blocks_count_lo: total_blocks,
        log_block_size: 2,
        blocks_per_group: BLOCKS_PER_GROUP,
        clusters_per_group: BLOCKS_PER_GROUP,
        inodes_per_group: RECORDS_PER_GROUP,
        inode_size: RECORD_SIZE as u16,
        feature_incompat: INCOMPAT_FILETYPE,
        ..Default::default()
    }
}

pub fn group_table() -> Vec<u8> {
    let mut gd = GroupDescriptor::default();
    gd.set_locations(BLOCK_BITMAP, RECORD_BITMAP, RECORD_TABLE);
    gd.to_bytes(false)
}

pub fn regular_file(size: u64, blocks: &[u32]) -> FileRecord {
    let mut record = FileRecord {
        mode: 0o100644,
        links_count: 1,
        ..Default::default()
    };
    record.set_size(size);
    record.block[..blocks.len()].copy_from_slice(blocks);
    record
}

pub fn directory(block: u32) -> FileRecord {
    let mut record = FileRecord {
        mode: 0o040755,
        links_count: 2,
        ..Default::default()
    };
    record.set_size(BS as u64);
    record.block[0] = block;
    record
}

/// Entries packed into the first KiB of a block; the rest stays zeroed
pub fn directory_block(entries: &[(u32, &str, EntryType)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (i, (number, name, kind)) in entries.iter().enumerate() {
        let mut entry = DirectoryRecord::new(*number, name, *kind);
        if i + 1 == entries.len() {
            entry.rec_len = (1024 - data.len()) as u16;
        }
        data.extend_from_slice(&entry.to_bytes());
    }
    data.resize(BS, 0);
    data
}

pub fn record_offset(number: u32) -> u64 {
    RECORD_TABLE * BS as u64 + (number as u64 - 1) * RECORD_SIZE as u64
}

/// A sparse image file, written at explicit byte offsets
pub struct ImageFile {
    pub file: NamedTempFile,
}

impl ImageFile {
    pub fn new(len: u64) -> Self {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        ImageFile { file }
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> &mut Self {
        let f: &mut File = self.file.as_file_mut();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(data).unwrap();
        self
    }

    pub fn write_block(&mut self, block: u64, data: &[u8]) -> &mut Self {
        self.write_at(block * BS as u64, data)
    }

    pub fn write_record(&mut self, number: u32, record: &FileRecord) -> &mut Self {
        self.write_at(record_offset(number), &record.to_bytes(RECORD_SIZE))
    }

    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }
}

/// A complete primary-only image in memory
pub fn memory_image(total_blocks: u32, records: &[(u32, FileRecord)], blocks: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut image = vec![0u8; total_blocks as usize * BS];
    image[1024..2048].copy_from_slice(&descriptor(total_blocks).to_bytes());
    let table = group_table();
    image[BS..BS + table.len()].copy_from_slice(&table);

    for (number, record) in records {
        let offset = record_offset(*number) as usize;
        image[offset..offset + RECORD_SIZE].copy_from_slice(&record.to_bytes(RECORD_SIZE));
    }
    for (block, data) in blocks {
        let offset = *block as usize * BS;
        image[offset..offset + data.len()].copy_from_slice(data);
    }
    image
}
