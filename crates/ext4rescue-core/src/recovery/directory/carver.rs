//! Raw directory-entry carving
//!
//! Scans every block of the volume for `ext4_dir_entry_2` records without
//! consulting allocation state or record tables. Useful once the metadata is
//! gone: names, record numbers and (through each block's `.` entry) parent
//! directories can still be pieced together.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;

use super::{DirectoryReconstructor, ReconstructionStats};
use crate::error::Result;
use crate::fs::common::BlockDevice;
use crate::fs::ext4::dirent::{DirectoryRecord, ENTRY_HEADER_SIZE};
use crate::fs::ext4::{EntryType, Geometry, ROOT_RECORD};
use crate::recovery::{ScanProgress, ScanStage};

const MIN_REC_LEN: u16 = 12;
const MAX_REC_LEN: u16 = 1024;
const MAX_TYPE_TAG: u8 = 7;
const RESYNC_STEP: usize = 4;
const MAX_PATH_DEPTH: u32 = 100;
const PROGRESS_INTERVAL: u64 = 1000;

/// A name recovered from a raw block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarvedDirectoryEntry {
    /// Block where the entry was found
    pub source_block: u64,
    /// Record number the name points to (0 for a released slot)
    pub number: u32,
    pub name: String,
    pub entry_type: EntryType,
    /// Directory owning the block, from its `.` entry
    pub parent: Option<u32>,
}

pub struct DirectoryCarver {
    entries: Vec<CarvedDirectoryEntry>,
    /// Record number -> first entry naming it
    named: HashMap<u32, usize>,
    paths: HashMap<u32, PathBuf>,
    block_size: u32,
    total_blocks: u64,
    total_records: u32,
    root: u32,
    progress_callback: Option<Box<dyn Fn(ScanProgress) + Send + Sync>>,
}

impl DirectoryCarver {
    pub fn new(geometry: &Geometry) -> Self {
        Self {
            entries: Vec::new(),
            named: HashMap::new(),
            paths: HashMap::new(),
            block_size: geometry.block_size,
            total_blocks: geometry.total_blocks,
            total_records: geometry.total_records,
            root: ROOT_RECORD,
            progress_callback: None,
        }
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(ScanProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Set the record used as `/` during path reconstruction
    pub fn set_root(&mut self, number: u32) {
        self.root = number;
        self.paths.clear();
        tracing::debug!("🌳 Root record set to: {}", number);
    }

    pub fn entries(&self) -> &[CarvedDirectoryEntry] {
        &self.entries
    }

    pub fn add_entries(&mut self, entries: Vec<CarvedDirectoryEntry>) {
        for entry in entries {
            if entry.number != 0 {
                self.named.entry(entry.number).or_insert(self.entries.len());
            }
            self.entries.push(entry);
        }
        self.paths.clear();
    }

    fn is_plausible(&self, record: &DirectoryRecord) -> bool {
        record.number <= self.total_records
            && (MIN_REC_LEN..=MAX_REC_LEN).contains(&record.rec_len)
            && record.file_type <= MAX_TYPE_TAG
    }

    /// Every plausible entry of one block except `.` and `..`.
    ///
    /// An accepted entry advances the cursor by its record length, a rejected
    /// one by 4 bytes.
    pub fn parse_block(&self, data: &[u8], block: u64) -> Vec<CarvedDirectoryEntry> {
        let mut entries = Vec::new();
        let mut parent = None;
        let mut offset = 0;

        while offset + ENTRY_HEADER_SIZE < data.len() {
            let record = match DirectoryRecord::parse(&data[offset..]) {
                Ok(r) if self.is_plausible(&r) => r,
                _ => {
                    offset += RESYNC_STEP;
                    continue;
                }
            };
            offset += record.rec_len as usize;

            if record.name.is_empty() {
                continue;
            }
            if record.name == b"." {
                parent = Some(record.number);
                continue;
            }
            if record.name == b".." {
                continue;
            }

            let name = record.name_lossy();
            if name.chars().any(char::is_control) {
                continue;
            }

            entries.push(CarvedDirectoryEntry {
                source_block: block,
                number: record.number,
                name,
                entry_type: record.entry_type().unwrap_or(EntryType::Unknown),
                parent,
            });
        }

        entries
    }

    /// Carve blocks `start..end`, clamped to the volume and the device.
    /// Unreadable blocks are skipped.
    pub fn scan_range(&mut self, device: &BlockDevice, start: u64, end: u64) -> usize {
        let end = end
            .min(self.total_blocks)
            .min(device.size() / self.block_size as u64);
        let before = self.entries.len();

        for block in start..end {
            match device.read_block(block, self.block_size) {
                Ok(data) => {
                    let entries = self.parse_block(data, block);
                    if !entries.is_empty() {
                        tracing::debug!("📂 Found {} entries in block {}", entries.len(), block);
                        self.add_entries(entries);
                    }
                }
                Err(e) => tracing::warn!("⚠️ Skipping unreadable block {}: {}", block, e),
            }

            if (block - start) % PROGRESS_INTERVAL == 0 {
                if let Some(ref callback) = self.progress_callback {
                    callback(ScanProgress {
                        stage: ScanStage::DirectoryCarving,
                        current: block - start,
                        total: end - start,
                        found: self.entries.len(),
                        current_operation: format!("Block {}", block),
                    });
                }
            }
        }

        self.entries.len() - before
    }

    /// Directory entries grouped by the record they name
    pub fn directories(&self) -> BTreeMap<u32, BTreeSet<&str>> {
        let mut dirs: BTreeMap<u32, BTreeSet<&str>> = BTreeMap::new();
        for entry in self.entries.iter().filter(|e| e.entry_type == EntryType::Directory) {
            dirs.entry(entry.number).or_default().insert(&entry.name);
        }
        dirs
    }

    /// Regular-file names with every record number seen under them
    pub fn files_by_name(&self) -> BTreeMap<&str, BTreeSet<u32>> {
        let mut files: BTreeMap<&str, BTreeSet<u32>> = BTreeMap::new();
        for entry in self.entries.iter().filter(|e| e.entry_type == EntryType::File) {
            files.entry(&entry.name).or_default().insert(entry.number);
        }
        files
    }

    /// Text report of the grouped results
    pub fn report(&self) -> String {
        let dirs = self.directories();
        let files = self.files_by_name();
        let file_records: BTreeSet<u32> = files.values().flatten().copied().collect();
        let mut out = String::new();

        let _ = writeln!(out, "RECOVERED DIRECTORY STRUCTURE");
        let _ = writeln!(out, "=============================");
        let _ = writeln!(out, "Entries: {}", self.entries.len());
        let _ = writeln!(out, "Unique directory records: {}", dirs.len());
        let _ = writeln!(out, "Unique file records: {}", file_records.len());

        let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in &self.entries {
            *by_type.entry(entry.entry_type.name()).or_default() += 1;
        }
        for (kind, count) in by_type {
            let _ = writeln!(out, "  {:10} {:>6}", kind, count);
        }

        if !dirs.is_empty() {
            let _ = writeln!(out, "\nDIRECTORIES:");
            for (number, names) in &dirs {
                let names: Vec<&str> = names.iter().copied().collect();
                let _ = writeln!(out, "Record {:6}: {}", number, names.join(", "));
            }
        }

        if !files.is_empty() {
            let _ = writeln!(out, "\nFILES:");
            for (name, numbers) in &files {
                let numbers: Vec<String> = numbers.iter().map(u32::to_string).collect();
                let label = if numbers.len() == 1 { "record" } else { "records" };
                let _ = writeln!(out, "{:40} {} {}", name, label, numbers.join(", "));
            }
        }
        out
    }

    /// Build a path by walking parent links
    fn build_path(&mut self, number: u32, max_depth: u32) -> Option<PathBuf> {
        if let Some(path) = self.paths.get(&number) {
            return Some(path.clone());
        }
        if number == self.root {
            let path = PathBuf::from("/");
            self.paths.insert(number, path.clone());
            return Some(path);
        }
        if max_depth == 0 {
            return None;
        }

        let entry = self.entries.get(*self.named.get(&number)?)?.clone();

        if let Some(parent) = entry.parent {
            if parent == self.root {
                let path = PathBuf::from("/").join(&entry.name);
                self.paths.insert(number, path.clone());
                return Some(path);
            }
            if parent != 0 && parent != number {
                if let Some(parent_path) = self.build_path(parent, max_depth - 1) {
                    let path = parent_path.join(&entry.name);
                    self.paths.insert(number, path.clone());
                    return Some(path);
                }
            }
        }

        // Detached: no parent chain reaches the root
        let path = PathBuf::from(&entry.name);
        self.paths.insert(number, path.clone());
        Some(path)
    }
}

impl DirectoryReconstructor for DirectoryCarver {
    fn scan_directories(&mut self, device: &BlockDevice) -> Result<usize> {
        tracing::info!(
            "🔍 Carving {} blocks for directory entries",
            self.total_blocks
        );
        self.scan_range(device, 0, self.total_blocks);
        tracing::info!("✅ Found {} directory entries", self.entries.len());
        Ok(self.entries.len())
    }

    fn reconstruct_path(&mut self, id: u64) -> Option<PathBuf> {
        let number = u32::try_from(id).ok()?;
        self.build_path(number, MAX_PATH_DEPTH)
    }

    fn get_filename(&self, id: u64) -> Option<String> {
        let number = u32::try_from(id).ok()?;
        self.named
            .get(&number)
            .and_then(|&i| self.entries.get(i))
            .map(|e| e.name.clone())
    }

    fn stats(&self) -> ReconstructionStats {
        ReconstructionStats {
            total_entries: self.entries.len(),
            paths_reconstructed: self.paths.len(),
            root_id: Some(self.root as u64),
        }
    }
}
