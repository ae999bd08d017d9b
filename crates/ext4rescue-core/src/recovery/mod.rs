/// Recovery algorithms layered on the ext4 codec and volume accessor
pub mod backup;
pub mod bitmap;
pub mod carver;
pub mod directory;
pub mod signatures;

pub use backup::{BackupEntry, BackupStore, DirBackupStore, MemoryBackupStore, SavedRegion};
pub use bitmap::{BitmapDelta, BitmapRebuilder, GroupBitmaps, RebuiltBitmaps};
pub use carver::{carve_summary, export_carved_files, trim_padding, CarvedFile, FileCarver};
pub use directory::{
    CarvedDirectoryEntry, DirectoryCarver, DirectoryListing, DirectoryReconstructor,
    DirectoryTree, DirectoryWalker, ReconstructionStats, TreeNode,
};
pub use signatures::{find_signature, CarveSignature, TailPolicy, CARVE_SIGNATURES};

/// Progress of a long block-range scan
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub stage: ScanStage,
    /// Blocks processed so far, relative to the start of the range
    pub current: u64,
    pub total: u64,
    pub found: usize,
    pub current_operation: String,
}

impl ScanProgress {
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            100.0
        } else {
            self.current as f32 * 100.0 / self.total as f32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStage {
    FileCarving,
    DirectoryCarving,
}
