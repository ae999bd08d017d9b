//! Naming-tree recovery through metadata and through raw carving

mod common;

use common::*;
use ext4rescue_core::fs::common::BlockDevice;
use ext4rescue_core::fs::ext4::{EntryType, Volume};
use ext4rescue_core::recovery::{DirectoryCarver, DirectoryReconstructor, DirectoryWalker};
use ext4rescue_core::WalkOptions;
use std::path::PathBuf;

// / (record 2, block 10)
//   home/ (12, block 11)
//     user/ (13, block 12)
//       documents/ (14, block 13)
//         report.pdf (20)
//       file.txt (21)
fn sample_image() -> BlockDevice {
    let blocks = vec![
        (
            10,
            directory_block(&[
                (2, ".", EntryType::Directory),
                (2, "..", EntryType::Directory),
                (12, "home", EntryType::Directory),
            ]),
        ),
        (
            11,
            directory_block(&[
                (12, ".", EntryType::Directory),
                (2, "..", EntryType::Directory),
                (13, "user", EntryType::Directory),
            ]),
        ),
        (
            12,
            directory_block(&[
                (13, ".", EntryType::Directory),
                (12, "..", EntryType::Directory),
                (14, "documents", EntryType::Directory),
                (21, "file.txt", EntryType::File),
            ]),
        ),
        (
            13,
            directory_block(&[
                (14, ".", EntryType::Directory),
                (13, "..", EntryType::Directory),
                (20, "report.pdf", EntryType::File),
            ]),
        ),
    ];
    let records = vec![
        (2, directory(10)),
        (12, directory(11)),
        (13, directory(12)),
        (14, directory(13)),
        (20, regular_file(10, &[])),
        (21, regular_file(10, &[])),
    ];
    BlockDevice::from_bytes(memory_image(32, &records, &blocks))
}

#[test]
fn test_walker_and_carver_agree_on_paths() {
    let device = sample_image();
    let volume = Volume::open(&device).unwrap();

    let tree = DirectoryWalker::new(&volume, WalkOptions::default())
        .rebuild_tree(2, 10)
        .unwrap();
    let walked: Vec<(u32, PathBuf)> = tree
        .entries()
        .into_iter()
        .map(|(path, node)| (node.number, path))
        .collect();
    assert_eq!(walked.len(), 5);

    let mut carver = DirectoryCarver::new(volume.geometry());
    carver.scan_directories(&device).unwrap();
    for (number, path) in &walked {
        assert_eq!(carver.reconstruct_path(*number as u64).as_ref(), Some(path));
    }
    assert_eq!(
        carver.reconstruct_path(20),
        Some(PathBuf::from("/home/user/documents/report.pdf"))
    );
    assert_eq!(carver.get_filename(14).as_deref(), Some("documents"));
    assert_eq!(carver.stats().total_entries, 5);
}

#[test]
fn test_carver_survives_lost_record_table() {
    let device = sample_image();
    let geometry = *Volume::open(&device).unwrap().geometry();

    // Wipe the record table: the walker has nothing left, the carver still works
    let mut raw = device.as_bytes().to_vec();
    let table = RECORD_TABLE as usize * BS;
    raw[table..table + 2 * BS].fill(0);
    let wiped = BlockDevice::from_bytes(raw);

    let volume = Volume::open(&wiped).unwrap();
    assert!(DirectoryWalker::new(&volume, WalkOptions::default())
        .rebuild_tree(2, 10)
        .is_err());

    let mut carver = DirectoryCarver::new(&geometry);
    assert_eq!(carver.scan_directories(&wiped).unwrap(), 5);
    assert_eq!(
        carver.reconstruct_path(21),
        Some(PathBuf::from("/home/user/file.txt"))
    );
    assert!(carver.report().contains("file.txt"));
}
