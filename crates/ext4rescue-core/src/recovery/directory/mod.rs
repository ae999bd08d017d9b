//! Directory recovery: metadata-driven walking and raw entry carving
//!
//! The walker follows record block pointers from a known directory. The
//! carver ignores metadata entirely and reconstructs paths from the parent
//! chain of carved entries.

mod carver;
mod walker;

pub use carver::{CarvedDirectoryEntry, DirectoryCarver};
pub use walker::{DirectoryListing, DirectoryTree, DirectoryWalker, TreeNode};

use crate::error::Result;
use crate::fs::common::BlockDevice;
use std::path::PathBuf;

/// Statistics from directory reconstruction
#[derive(Debug, Default)]
pub struct ReconstructionStats {
    /// Total directory entries found
    pub total_entries: usize,
    /// Number of paths successfully reconstructed
    pub paths_reconstructed: usize,
    /// Root record if known
    pub root_id: Option<u64>,
}

/// Path reconstruction from directory entries found on a device
pub trait DirectoryReconstructor {
    /// Scan the device for directory entries
    fn scan_directories(&mut self, device: &BlockDevice) -> Result<usize>;

    /// Reconstruct the full path for a given record
    fn reconstruct_path(&mut self, id: u64) -> Option<PathBuf>;

    /// Get just the filename (without path) for a given record
    fn get_filename(&self, id: u64) -> Option<String>;

    /// Get reconstruction statistics
    fn stats(&self) -> ReconstructionStats;
}
