//! Bitmap rebuild against a file-backed image, including write-back and rollback

mod common;

use common::*;
use ext4rescue_core::fs::common::BlockDevice;
use ext4rescue_core::fs::ext4::{Extent, ExtentNode, FileRecord, Volume, EXTENTS_FL};
use ext4rescue_core::recovery::{BitmapRebuilder, DirBackupStore};

const TOTAL_BLOCKS: u32 = 64;

fn records() -> Vec<(u32, FileRecord)> {
    let mut extent_file = regular_file(4 * BS as u64, &[]);
    extent_file.flags |= EXTENTS_FL;
    extent_file.set_block_bytes(&ExtentNode::leaf(vec![Extent::new(0, 4, 30)], 4).to_bytes());

    vec![
        (2, directory(10)),
        (12, regular_file(2 * BS as u64, &[20, 21])),
        (13, extent_file),
    ]
}

fn bit(bitmap: &[u8], n: usize) -> bool {
    bitmap[n / 8] & (1 << (n % 8)) != 0
}

#[test]
fn test_rebuild_is_idempotent_and_marks_expected_bits() {
    let device = BlockDevice::from_bytes(memory_image(TOTAL_BLOCKS, &records(), &[]));
    let volume = Volume::open(&device).unwrap();
    let scanned = volume.scan_all_records().unwrap();
    assert_eq!(scanned.len(), 3);

    let rebuilder = BitmapRebuilder::new(&volume);
    let first = rebuilder.rebuild(&scanned);
    let second = rebuilder.rebuild(&scanned);
    assert_eq!(first, second);

    let group = &first.groups[0];
    // Superblock block, group table, both bitmaps, two record-table blocks
    for used in [0, 1, 3, 4, 5, 6, 10, 20, 21, 30, 31, 32, 33] {
        assert!(bit(&group.block_bitmap, used), "block {}", used);
    }
    for free in [2, 7, 22, 34, 63] {
        assert!(!bit(&group.block_bitmap, free), "block {}", free);
    }
    assert_eq!(first.used_blocks(), 13);

    for used in [1, 11, 12] {
        assert!(bit(&group.record_bitmap, used));
    }
    assert_eq!(first.used_records(), 3);
}

#[test]
fn test_write_back_and_rollback() {
    let mut image = ImageFile::new(TOTAL_BLOCKS as u64 * BS as u64);
    image.write_at(0, &memory_image(TOTAL_BLOCKS, &records(), &[]));
    // Stale on-disk bitmap claiming a block nothing uses
    image.write_block(BLOCK_BITMAP, &[0x80]);
    let backups = tempfile::tempdir().unwrap();

    let rebuilt = {
        let device = BlockDevice::open(image.path()).unwrap();
        let volume = Volume::open(&device).unwrap();
        let rebuilt = BitmapRebuilder::new(&volume).rebuild(&volume.scan_all_records().unwrap());
        let delta = &rebuilt.compare(&device)[0];
        assert_eq!(delta.block_bits_changed, 14);
        assert_eq!(delta.record_bits_changed, 3);
        rebuilt
    };

    {
        let mut device = BlockDevice::open_writable(image.path()).unwrap();
        let mut store = DirBackupStore::new(backups.path()).unwrap();
        assert_eq!(rebuilt.write_back(&mut device, &mut store).unwrap(), 2);
        assert_eq!(store.entries().len(), 2);
    }

    {
        let device = BlockDevice::open(image.path()).unwrap();
        let delta = &rebuilt.compare(&device)[0];
        assert_eq!((delta.block_bits_changed, delta.record_bits_changed), (0, 0));
    }

    let mut device = BlockDevice::open_writable(image.path()).unwrap();
    let store = DirBackupStore::new(backups.path()).unwrap();
    store.restore_all(&mut device).unwrap();
    let restored = device
        .read_bytes(BLOCK_BITMAP * BS as u64, 1)
        .unwrap()
        .to_vec();
    assert_eq!(restored, vec![0x80]);
}
