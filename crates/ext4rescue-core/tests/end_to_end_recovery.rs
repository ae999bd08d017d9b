//! Whole-session recovery on an image whose primary superblock is destroyed

mod common;

use common::*;
use ext4rescue_core::fs::common::BlockDevice;
use ext4rescue_core::fs::ext4::{locate, restore_primary_descriptor, Volume};
use ext4rescue_core::recovery::DirBackupStore;
use ext4rescue_core::{recover_records, RecoveryStatus};

const BACKUP_OFFSET: u64 = BLOCKS_PER_GROUP as u64 * BS as u64;
const FILE_SIZE: u64 = BS as u64 + 100;

/// Primary superblock zeroed, backup intact at the start of group 1
fn damaged_image() -> ImageFile {
    let mut backup = descriptor(BLOCKS_PER_GROUP);
    backup.block_group_nr = 1;

    let mut image = ImageFile::new(BACKUP_OFFSET + 2 * BS as u64);
    image
        .write_at(BACKUP_OFFSET, &backup.to_bytes())
        .write_at(BACKUP_OFFSET + BS as u64, &group_table())
        .write_block(1, &group_table())
        .write_record(12, &regular_file(FILE_SIZE, &[20, 21]))
        .write_block(20, &[b'A'; BS])
        .write_block(21, &[b'B'; BS]);
    image
}

fn expected_content() -> Vec<u8> {
    let mut data = vec![b'A'; BS];
    data.extend(vec![b'B'; 100]);
    data
}

#[test]
fn test_locate_finds_group_one_backup() {
    let image = damaged_image();
    let device = BlockDevice::open(image.path()).unwrap();

    let located = locate(&device).unwrap();
    let source = located.source.as_ref().expect("backup should be used");
    assert_eq!(source.group, 1);
    assert_eq!(source.block_size, 4096);
    assert_eq!(located.offset, BACKUP_OFFSET);

    let mut expected = descriptor(BLOCKS_PER_GROUP);
    expected.block_group_nr = 1;
    assert_eq!(located.descriptor, expected);
}

#[test]
fn test_extract_through_backup_descriptor() {
    let image = damaged_image();
    let device = BlockDevice::open(image.path()).unwrap();
    let volume = Volume::open(&device).unwrap();

    let record = volume.resolve(12).unwrap();
    assert_eq!(record.size(), FILE_SIZE);
    assert_eq!(volume.extract(&record, record.size()).unwrap(), expected_content());
}

#[test]
fn test_recover_records_reports_each_record() {
    let image = damaged_image();
    let device = BlockDevice::open(image.path()).unwrap();
    let volume = Volume::open(&device).unwrap();
    let out = tempfile::tempdir().unwrap();

    let report = recover_records(&volume, &[12, 13], out.path()).unwrap();
    assert_eq!(report.recovered_files, 1);
    assert_eq!(report.failed_files, 1);
    assert_eq!(report.recovery_details[0].status, RecoveryStatus::Success);
    assert!(matches!(report.recovery_details[1].status, RecoveryStatus::Failed(_)));
    assert_eq!(
        std::fs::read(out.path().join("record_12")).unwrap(),
        expected_content()
    );
}

#[test]
fn test_restore_primary_then_roll_back() {
    let image = damaged_image();
    let backups = tempfile::tempdir().unwrap();

    {
        let mut device = BlockDevice::open_writable(image.path()).unwrap();
        let located = locate(&device).unwrap();
        let mut store = DirBackupStore::new(backups.path()).unwrap();
        assert!(restore_primary_descriptor(&mut device, &located, &mut store).unwrap());
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.entries()[0].offset, 1024);
    }

    {
        let device = BlockDevice::open(image.path()).unwrap();
        let located = locate(&device).unwrap();
        assert!(located.is_primary());
        assert_eq!(located.descriptor.block_group_nr, 0);
        assert_eq!(located.descriptor.blocks_count_lo, BLOCKS_PER_GROUP);

        let volume = Volume::open(&device).unwrap();
        assert_eq!(volume.extract_file(12).unwrap(), expected_content());
    }

    {
        // A second restore has nothing to do
        let mut device = BlockDevice::open_writable(image.path()).unwrap();
        let located = locate(&device).unwrap();
        let mut store = DirBackupStore::new(backups.path()).unwrap();
        assert!(!restore_primary_descriptor(&mut device, &located, &mut store).unwrap());

        assert_eq!(store.restore_all(&mut device).unwrap(), 1);
    }

    let device = BlockDevice::open(image.path()).unwrap();
    assert!(!locate(&device).unwrap().is_primary());
}

#[test]
fn test_restore_requires_writable_device() {
    let image = damaged_image();
    let mut device = BlockDevice::open(image.path()).unwrap();
    let located = locate(&device).unwrap();
    let mut store = ext4rescue_core::recovery::MemoryBackupStore::default();

    let err = restore_primary_descriptor(&mut device, &located, &mut store).unwrap_err();
    assert!(err.is_io());
    assert!(store.entries.is_empty());
}

#[test]
fn test_blank_image_has_no_descriptor() {
    let image = ImageFile::new(64 * BS as u64);
    let device = BlockDevice::open(image.path()).unwrap();
    assert!(matches!(
        locate(&device),
        Err(ext4rescue_core::RecoveryError::NotFound(_))
    ));
}
