/// Tunables for recovery sessions
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RecoveryError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Depth bound for naming-tree rebuilds
    pub tree_max_depth: usize,
    pub walk: WalkOptions,
    pub carve: CarveConfig,
    pub volume_scan: VolumeScanConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            tree_max_depth: 10,
            walk: WalkOptions::default(),
            carve: CarveConfig::default(),
            volume_scan: VolumeScanConfig::default(),
        }
    }
}

impl RecoveryConfig {
    /// Load a JSON config file; missing keys keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(|e| {
            RecoveryError::invalid(format!(
                "config {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }
}

/// Directory listing behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkOptions {
    /// Read leaf extents embedded in extent-mapped directories instead of
    /// reporting them as unsupported
    pub follow_leaf_extents: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarveConfig {
    /// A header must start within this many bytes of a block start
    pub header_window: usize,
    pub max_blocks_per_file: u64,
    /// Below-minimum footers are accepted once this many blocks were read
    pub min_size_block_budget: u64,
    /// Bytes hashed for duplicate suppression
    pub dedup_prefix: usize,
}

impl Default for CarveConfig {
    fn default() -> Self {
        Self {
            header_window: 512,
            max_blocks_per_file: 200,
            min_size_block_budget: 10,
            dedup_prefix: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeScanConfig {
    pub step: u64,
    pub limit: u64,
}

impl Default for VolumeScanConfig {
    fn default() -> Self {
        Self {
            step: 1024 * 1024,          // 1MB
            limit: 100 * 1024 * 1024 * 1024, // 100GB
        }
    }
}
