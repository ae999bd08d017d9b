//! Metadata-driven directory listing and naming-tree rebuild
//!
//! Directories are read through their record's block pointers and each block
//! is decoded in resynchronizing mode, so a single corrupt entry does not hide
//! the rest of the block.

use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::WalkOptions;
use crate::error::{RecoveryError, Result};
use crate::fs::ext4::inode::DIRECT_POINTERS;
use crate::fs::ext4::{
    BlockMap, DirectoryRecord, DirectoryRecords, EntryType, FileRecord, RecordKind, Volume,
    ROOT_RECORD,
};

/// One live name in a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    pub number: u32,
    pub name: String,
    pub entry_type: EntryType,
}

impl DirectoryListing {
    pub fn is_dot_entry(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// A node of the rebuilt naming tree
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub number: u32,
    pub name: String,
    pub entry_type: EntryType,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn visit<'n>(&'n self, path: &Path, out: &mut Vec<(PathBuf, &'n TreeNode)>) {
        for child in &self.children {
            let child_path = path.join(&child.name);
            out.push((child_path.clone(), child));
            child.visit(&child_path, out);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryTree {
    pub root: TreeNode,
    /// Directories not descended into because the depth bound was reached
    pub truncated: usize,
    /// Directories whose listing failed and were left empty
    pub unreadable: usize,
}

impl DirectoryTree {
    /// Every entry below the root with its full path, depth first
    pub fn entries(&self) -> Vec<(PathBuf, &TreeNode)> {
        let mut out = Vec::new();
        self.root.visit(Path::new("/"), &mut out);
        out
    }

    /// Text listing: one `path  #record  [type]` line per entry
    pub fn report(&self) -> String {
        let entries = self.entries();
        let mut report = String::new();
        let _ = writeln!(report, "/  #{}  [{}]", self.root.number, self.root.entry_type);
        for (path, node) in &entries {
            let _ = writeln!(
                report,
                "{}  #{}  [{}]",
                path.display(),
                node.number,
                node.entry_type
            );
        }
        let _ = writeln!(report);
        let _ = writeln!(report, "Entries: {}", entries.len());
        if self.truncated > 0 {
            let _ = writeln!(report, "Depth-limited directories: {}", self.truncated);
        }
        if self.unreadable > 0 {
            let _ = writeln!(report, "Unreadable directories: {}", self.unreadable);
        }
        report
    }
}

/// Lists directories and rebuilds the naming tree of a volume
pub struct DirectoryWalker<'v, 'a> {
    volume: &'v Volume<'a>,
    options: WalkOptions,
}

impl<'v, 'a> DirectoryWalker<'v, 'a> {
    pub fn new(volume: &'v Volume<'a>, options: WalkOptions) -> Self {
        Self { volume, options }
    }

    /// Data blocks of a directory record, in logical order
    fn directory_blocks(&self, record: &FileRecord) -> Result<Vec<u64>> {
        let block_size = self.volume.block_size() as u64;
        match record.block_map()? {
            BlockMap::Direct(pointers) => Ok(pointers),
            BlockMap::Indirect { direct, single, .. } => {
                if record.size() > DIRECT_POINTERS as u64 * block_size {
                    return Err(RecoveryError::unsupported(format!(
                        "directory of {} bytes needs indirect block {}",
                        record.size(),
                        single
                    )));
                }
                Ok(direct)
            }
            BlockMap::ExtentLeaf(extents) => {
                if !self.options.follow_leaf_extents {
                    return Err(RecoveryError::unsupported(
                        "extent-mapped directory listing is disabled",
                    ));
                }
                let mut extents = extents;
                extents.sort_by_key(|e| e.logical_block);
                Ok(extents
                    .iter()
                    .filter(|e| !e.is_uninitialized())
                    .flat_map(|e| (0..e.len() as u64).map(move |i| e.physical_start() + i))
                    .collect())
            }
            BlockMap::ExtentInternal(indexes) => Err(RecoveryError::unsupported(format!(
                "extent-mapped directory with {} index entries",
                indexes.len()
            ))),
            BlockMap::Inline => Ok(Vec::new()),
        }
    }

    /// Names in a directory record, including `.` and `..`.
    ///
    /// Entries pointing past the volume's record count are dropped.
    pub fn list(&self, record: &FileRecord) -> Result<Vec<DirectoryListing>> {
        let kind = record.kind();
        if kind != RecordKind::Directory {
            return Err(RecoveryError::WrongRecordType {
                expected: RecordKind::Directory.name(),
                found: kind.name(),
            });
        }

        let total_records = self.volume.geometry().total_records;
        let keep = |entry: &DirectoryRecord| entry.number <= total_records;
        let mut listing = Vec::new();

        if record.has_inline_data() {
            // Inline directories store the parent number, then packed entries
            let inline = record.block_bytes();
            let parent = u32::from_le_bytes([inline[0], inline[1], inline[2], inline[3]]);
            if parent != 0 && parent <= total_records {
                listing.push(DirectoryListing {
                    number: parent,
                    name: "..".to_string(),
                    entry_type: EntryType::Directory,
                });
            }
            listing.extend(DirectoryRecords::resync(&inline[4..]).filter(keep).map(to_listing));
            return Ok(listing);
        }

        for block in self.directory_blocks(record)? {
            let data = self.volume.read_block(block)?;
            let before = listing.len();
            listing.extend(DirectoryRecords::resync(data).filter(keep).map(to_listing));
            debug!("📂 Block {}: {} entries", block, listing.len() - before);
        }
        Ok(listing)
    }

    /// Resolve a record number and list it
    pub fn list_number(&self, number: u32) -> Result<Vec<DirectoryListing>> {
        let record = self.volume.resolve(number)?;
        self.list(&record)
    }

    /// Walk from `root` (record 2 for a whole volume), descending into every
    /// directory entry except `.` and `..`.
    ///
    /// Failing to list `root` is an error. Below it, an unreadable directory
    /// is logged and kept as a leaf, and branches deeper than `max_depth` are
    /// not descended.
    pub fn rebuild_tree(&self, root: u32, max_depth: usize) -> Result<DirectoryTree> {
        info!("🌳 Rebuilding naming tree from record {} (depth {})", root, max_depth);
        let entries = self.list_number(root)?;

        let mut tree = DirectoryTree {
            root: TreeNode {
                number: root,
                name: if root == ROOT_RECORD { "/".to_string() } else { format!("#{}", root) },
                entry_type: EntryType::Directory,
                children: Vec::new(),
            },
            truncated: 0,
            unreadable: 0,
        };
        let mut children = Vec::new();
        for entry in entries.into_iter().filter(|e| !e.is_dot_entry()) {
            children.push(self.build_node(entry, 1, max_depth, &mut tree));
        }
        tree.root.children = children;

        info!("✅ Naming tree has {} entries", tree.entries().len());
        Ok(tree)
    }

    fn build_node(
        &self,
        entry: DirectoryListing,
        depth: usize,
        max_depth: usize,
        tree: &mut DirectoryTree,
    ) -> TreeNode {
        let mut node = TreeNode {
            number: entry.number,
            name: entry.name,
            entry_type: entry.entry_type,
            children: Vec::new(),
        };
        if node.entry_type != EntryType::Directory {
            return node;
        }
        if depth >= max_depth {
            tree.truncated += 1;
            return node;
        }

        match self.list_number(node.number) {
            Ok(entries) => {
                for child in entries.into_iter().filter(|e| !e.is_dot_entry()) {
                    node.children.push(self.build_node(child, depth + 1, max_depth, tree));
                }
            }
            Err(e) => {
                warn!("⚠️ Cannot list directory #{} ({}): {}", node.number, node.name, e);
                tree.unreadable += 1;
            }
        }
        node
    }
}

fn to_listing(entry: DirectoryRecord) -> DirectoryListing {
    DirectoryListing {
        number: entry.number,
        name: entry.name_lossy(),
        entry_type: entry.entry_type().unwrap_or(EntryType::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::common::BlockDevice;
    use crate::fs::ext4::{Descriptor, Extent, ExtentNode, GroupDescriptor, EXTENTS_FL};

    const BS: usize = 1024;

    /// 64-block image with 1 KiB blocks and 16 records at block 5
    fn image_with(records: &[(u32, FileRecord)], blocks: &[(u64, Vec<u8>)]) -> Vec<u8> {
        let mut image = vec![0u8; 64 * BS];
        let sb = Descriptor {
            inodes_count: 16,
            blocks_count_lo: 64,
            first_data_block: 1,
            blocks_per_group: 8192,
            inodes_per_group: 16,
            inode_size: 128,
            ..Default::default()
        };
        image[1024..2048].copy_from_slice(&sb.to_bytes());

        let mut gd = GroupDescriptor::default();
        gd.set_locations(3, 4, 5);
        image[2 * BS..2 * BS + 32].copy_from_slice(&gd.to_bytes(false));

        for (number, record) in records {
            let offset = 5 * BS + (*number as usize - 1) * 128;
            image[offset..offset + 128].copy_from_slice(&record.to_bytes(128));
        }
        for (block, data) in blocks {
            let offset = *block as usize * BS;
            image[offset..offset + data.len()].copy_from_slice(data);
        }
        image
    }

    fn directory(block: u32) -> FileRecord {
        let mut record = FileRecord {
            mode: 0x41ED,
            links_count: 2,
            ..Default::default()
        };
        record.set_size(BS as u64);
        record.block[0] = block;
        record
    }

    /// Pack entries into one block, stretching the last over the remainder
    fn dir_block(entries: &[(u32, &str, EntryType)]) -> Vec<u8> {
        let mut data = Vec::new();
        for (i, (number, name, kind)) in entries.iter().enumerate() {
            let mut entry = DirectoryRecord::new(*number, name, *kind);
            if i + 1 == entries.len() {
                entry.rec_len = (BS - data.len()) as u16;
            }
            data.extend_from_slice(&entry.to_bytes());
        }
        data.resize(BS, 0);
        data
    }

    fn sample_volume() -> BlockDevice {
        let root = dir_block(&[
            (2, ".", EntryType::Directory),
            (2, "..", EntryType::Directory),
            (12, "docs", EntryType::Directory),
            (13, "a.txt", EntryType::File),
        ]);
        let docs = dir_block(&[
            (12, ".", EntryType::Directory),
            (2, "..", EntryType::Directory),
            (14, "b.txt", EntryType::File),
        ]);
        let file = FileRecord {
            mode: 0x81A4,
            ..Default::default()
        };
        BlockDevice::from_bytes(image_with(
            &[(2, directory(20)), (12, directory(21)), (13, file.clone()), (14, file)],
            &[(20, root), (21, docs)],
        ))
    }

    #[test]
    fn test_list_includes_dot_entries() {
        let device = sample_volume();
        let volume = Volume::open(&device).unwrap();
        let walker = DirectoryWalker::new(&volume, WalkOptions::default());

        let names: Vec<String> = walker.list_number(2).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![".", "..", "docs", "a.txt"]);
    }

    #[test]
    fn test_rebuild_tree_paths() {
        let device = sample_volume();
        let volume = Volume::open(&device).unwrap();
        let walker = DirectoryWalker::new(&volume, WalkOptions::default());

        let tree = walker.rebuild_tree(ROOT_RECORD, 10).unwrap();
        let paths: Vec<(String, u32)> = tree
            .entries()
            .into_iter()
            .map(|(p, n)| (p.display().to_string(), n.number))
            .collect();
        assert_eq!(
            paths,
            vec![
                ("/docs".to_string(), 12),
                ("/docs/b.txt".to_string(), 14),
                ("/a.txt".to_string(), 13),
            ]
        );
        let report = tree.report();
        assert!(report.contains("/docs/b.txt  #14  [File]"));
        assert!(report.contains("/docs  #12  [Dir]"));
    }

    #[test]
    fn test_corrupt_entry_resyncs() {
        let mut block = DirectoryRecord::new(12, "one", EntryType::File).to_bytes();
        // A header with a zero record length mid-block
        block.extend_from_slice(&[99, 0, 0, 0, 0, 0, 0, 0]);
        let mut two = DirectoryRecord::new(13, "two", EntryType::File);
        two.rec_len = (BS - block.len()) as u16;
        block.extend_from_slice(&two.to_bytes());

        let device = BlockDevice::from_bytes(image_with(&[(2, directory(20))], &[(20, block)]));
        let volume = Volume::open(&device).unwrap();
        let walker = DirectoryWalker::new(&volume, WalkOptions::default());

        let numbers: Vec<u32> = walker.list_number(2).unwrap().iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![12, 13]);
    }

    #[test]
    fn test_out_of_range_numbers_dropped() {
        let block = dir_block(&[(12, "ok", EntryType::File), (999, "bogus", EntryType::File)]);
        let device = BlockDevice::from_bytes(image_with(&[(2, directory(20))], &[(20, block)]));
        let volume = Volume::open(&device).unwrap();
        let walker = DirectoryWalker::new(&volume, WalkOptions::default());
        assert_eq!(walker.list_number(2).unwrap().len(), 1);
    }

    #[test]
    fn test_cycle_is_depth_bounded() {
        let root = dir_block(&[(12, "loop", EntryType::Directory)]);
        let looped = dir_block(&[(12, "again", EntryType::Directory)]);
        let device = BlockDevice::from_bytes(image_with(
            &[(2, directory(20)), (12, directory(21))],
            &[(20, root), (21, looped)],
        ));
        let volume = Volume::open(&device).unwrap();
        let walker = DirectoryWalker::new(&volume, WalkOptions::default());

        let tree = walker.rebuild_tree(2, 4).unwrap();
        assert_eq!(tree.entries().len(), 4);
        assert_eq!(tree.truncated, 1);
    }

    #[test]
    fn test_unreadable_child_is_skipped() {
        let root = dir_block(&[
            (12, "stale", EntryType::Directory),
            (13, "kept", EntryType::File),
        ]);
        let device = BlockDevice::from_bytes(image_with(&[(2, directory(20))], &[(20, root)]));
        let volume = Volume::open(&device).unwrap();
        let walker = DirectoryWalker::new(&volume, WalkOptions::default());

        let tree = walker.rebuild_tree(2, 10).unwrap();
        assert_eq!(tree.entries().len(), 2);
        assert_eq!(tree.unreadable, 1);
    }

    #[test]
    fn test_root_failure_propagates() {
        let device = BlockDevice::from_bytes(image_with(&[], &[]));
        let volume = Volume::open(&device).unwrap();
        let walker = DirectoryWalker::new(&volume, WalkOptions::default());
        assert!(matches!(
            walker.rebuild_tree(2, 10),
            Err(RecoveryError::WrongRecordType { .. })
        ));
    }

    #[test]
    fn test_extent_directory_needs_option() {
        let mut record = directory(0);
        record.flags |= EXTENTS_FL;
        record.set_block_bytes(&ExtentNode::leaf(vec![Extent::new(0, 1, 22)], 4).to_bytes());
        let block = dir_block(&[(13, "inside", EntryType::File)]);
        let device = BlockDevice::from_bytes(image_with(&[(2, record.clone())], &[(22, block)]));
        let volume = Volume::open(&device).unwrap();

        let strict = DirectoryWalker::new(&volume, WalkOptions::default());
        assert!(matches!(strict.list(&record), Err(RecoveryError::UnsupportedLayout(_))));

        let lenient = DirectoryWalker::new(&volume, WalkOptions { follow_leaf_extents: true });
        assert_eq!(lenient.list(&record).unwrap()[0].name, "inside");
    }
}
