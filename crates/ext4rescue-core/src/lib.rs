use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod config;
pub mod error;
pub mod fs;
pub mod recovery;

pub use config::{CarveConfig, RecoveryConfig, VolumeScanConfig, WalkOptions};
pub use error::{RecoveryError, Result};
pub use fs::common::BlockDevice;
pub use fs::ext4::{locate, Descriptor, FileRecord, Geometry, LocatedDescriptor, Volume};

/// Write recovered bytes verbatim to `path`, creating parent directories
pub fn write_recovered_file(path: &Path, data: &[u8]) -> Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.flush()?;
    Ok(data.len() as u64)
}

/// Extract records by number into `output_dir` as `record_<N>`.
///
/// A failing record is reported in the result and does not stop the rest.
pub fn recover_records(volume: &Volume<'_>, numbers: &[u32], output_dir: &Path) -> Result<RecoveryReport> {
    std::fs::create_dir_all(output_dir)?;

    let mut details = Vec::with_capacity(numbers.len());
    let mut recovered_files = 0;
    let mut total_bytes_recovered = 0u64;

    tracing::info!(
        "Starting recovery of {} records to {}",
        numbers.len(),
        output_dir.display()
    );

    for &number in numbers {
        let recovered_path = output_dir.join(format!("record_{}", number));
        match recover_single_record(volume, number, &recovered_path) {
            Ok((size, bytes_recovered)) => {
                recovered_files += 1;
                total_bytes_recovered += bytes_recovered;
                details.push(FileRecoveryResult {
                    record: number,
                    recovered_path,
                    size,
                    bytes_recovered,
                    status: RecoveryStatus::Success,
                });
                tracing::info!("✅ Recovered record {} ({} bytes)", number, bytes_recovered);
            }
            Err(e) => {
                details.push(FileRecoveryResult {
                    record: number,
                    recovered_path,
                    size: 0,
                    bytes_recovered: 0,
                    status: RecoveryStatus::Failed(e.to_string()),
                });
                tracing::warn!("❌ Failed to recover record {}: {}", number, e);
            }
        }
    }

    let report = RecoveryReport {
        total_files: numbers.len(),
        recovered_files,
        failed_files: numbers.len() - recovered_files,
        total_bytes_recovered,
        output_directory: output_dir.to_path_buf(),
        recovery_details: details,
    };

    tracing::info!(
        "Recovery complete: {}/{} records recovered, {} bytes total",
        report.recovered_files,
        report.total_files,
        report.total_bytes_recovered
    );
    Ok(report)
}

fn recover_single_record(volume: &Volume<'_>, number: u32, path: &Path) -> Result<(u64, u64)> {
    let record = volume.resolve(number)?;
    let data = volume.extract(&record, record.size())?;
    let written = write_recovered_file(path, &data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(record.permissions() as u32);
        std::fs::set_permissions(path, perms)?;
    }

    Ok((record.size(), written))
}

/// Outcome of a batch record recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub total_files: usize,
    pub recovered_files: usize,
    pub failed_files: usize,
    pub total_bytes_recovered: u64,
    pub output_directory: PathBuf,
    pub recovery_details: Vec<FileRecoveryResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecoveryResult {
    pub record: u32,
    pub recovered_path: PathBuf,
    /// Size declared by the record
    pub size: u64,
    pub bytes_recovered: u64,
    pub status: RecoveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Success,
    Failed(String),
}
