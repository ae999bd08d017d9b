/// Volume session: authoritative descriptor, geometry and group table over a device
use std::fmt::Write as _;
use std::io::{Error as IoError, ErrorKind};
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

use super::group::{read_group_table, GroupDescriptor};
use super::inode::{BlockMap, FileRecord, RecordKind, DIRECT_POINTERS};
use super::locator::{find_backups, locate, LocatedDescriptor};
use super::superblock::{Descriptor, Geometry};
use crate::error::{RecoveryError, Result};
use crate::fs::common::BlockDevice;

/// Everything derived once per recovery session.
///
/// Group and offset arithmetic lives here so the resolver, extractor, walker
/// and bitmap rebuilder share a single source of truth.
pub struct Volume<'a> {
    device: &'a BlockDevice,
    located: LocatedDescriptor,
    geometry: Geometry,
    groups: Vec<GroupDescriptor>,
}

impl<'a> Volume<'a> {
    /// Locate the descriptor and load the group table that follows it
    pub fn open(device: &'a BlockDevice) -> Result<Self> {
        let located = locate(device)?;
        Self::with_descriptor(device, located)
    }

    pub fn with_descriptor(device: &'a BlockDevice, located: LocatedDescriptor) -> Result<Self> {
        let geometry = located.descriptor.geometry()?;
        let table_block = located.offset / geometry.block_size as u64 + 1;
        let groups = read_group_table(device, &geometry, table_block);

        if groups.len() < geometry.group_count as usize {
            warn!(
                "⚠️ Only {}/{} group descriptors readable",
                groups.len(),
                geometry.group_count
            );
        }
        info!(
            "📊 Volume: {} blocks of {} bytes, {} groups, {} records",
            geometry.total_blocks, geometry.block_size, geometry.group_count, geometry.total_records
        );

        Ok(Volume {
            device,
            located,
            geometry,
            groups,
        })
    }

    pub fn device(&self) -> &'a BlockDevice {
        self.device
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.located.descriptor
    }

    pub fn located(&self) -> &LocatedDescriptor {
        &self.located
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn groups(&self) -> &[GroupDescriptor] {
        &self.groups
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub fn read_block(&self, block: u64) -> Result<&'a [u8]> {
        self.device.read_block(block, self.geometry.block_size)
    }

    /// Byte offset of a record in its group's record table
    pub fn record_offset(&self, number: u32) -> Result<u64> {
        let (group, index) = self
            .geometry
            .record_location(number)
            .ok_or_else(|| RecoveryError::not_found("record number 0"))?;
        let gd = self.groups.get(group as usize).ok_or_else(|| {
            RecoveryError::not_found(format!(
                "record {} lies in group {} but only {} groups are loaded",
                number,
                group,
                self.groups.len()
            ))
        })?;

        gd.record_table_location()
            .checked_mul(self.geometry.block_size as u64)
            .and_then(|table| table.checked_add(index as u64 * self.geometry.record_size as u64))
            .ok_or_else(|| {
                RecoveryError::invalid(format!(
                    "record table of group {} at block {} is outside any addressable range",
                    group,
                    gd.record_table_location()
                ))
            })
    }

    /// Read and decode a record. Every call re-reads the device.
    pub fn resolve(&self, number: u32) -> Result<FileRecord> {
        let offset = self.record_offset(number)?;
        let data = self
            .device
            .read_bytes(offset, self.geometry.record_size as usize)?;
        FileRecord::parse(data)
    }

    /// Every in-use record in `range`, labelled with its number.
    ///
    /// Unreadable records are skipped; the scan only fails when not a single
    /// record could be read.
    pub fn scan_records(&self, range: RangeInclusive<u32>) -> Result<Vec<(u32, FileRecord)>> {
        let start = (*range.start()).max(1);
        let end = (*range.end()).min(self.geometry.total_records);
        let mut records = Vec::new();
        let mut attempted = 0u64;
        let mut failed = 0u64;

        for number in start..=end {
            attempted += 1;
            match self.resolve(number) {
                Ok(record) if record.is_valid() => records.push((number, record)),
                Ok(_) => {}
                Err(e) => {
                    failed += 1;
                    debug!("Skipping record {}: {}", number, e);
                }
            }
        }

        if attempted > 0 && failed == attempted {
            return Err(RecoveryError::IoFailure(IoError::new(
                ErrorKind::Other,
                format!("none of the {} records in {}..={} were readable", attempted, start, end),
            )));
        }
        if failed > 0 {
            warn!("⚠️ {} of {} records unreadable", failed, attempted);
        }
        info!(
            "✅ Record scan {}..={}: {} in use",
            start,
            end,
            records.len()
        );
        Ok(records)
    }

    /// Scan the whole record-number space
    pub fn scan_all_records(&self) -> Result<Vec<(u32, FileRecord)>> {
        self.scan_records(1..=self.geometry.total_records)
    }

    /// Copy up to `budget` bytes of a regular file's content.
    ///
    /// Only direct pointers and leaf extents stored in the record are read;
    /// anything needing indirect blocks or internal extent nodes fails with
    /// `UnsupportedLayout`.
    pub fn extract(&self, record: &FileRecord, budget: u64) -> Result<Vec<u8>> {
        let kind = record.kind();
        if kind != RecordKind::Regular {
            return Err(RecoveryError::WrongRecordType {
                expected: RecordKind::Regular.name(),
                found: kind.name(),
            });
        }

        let block_size = self.geometry.block_size as u64;
        match record.block_map()? {
            BlockMap::Inline => {
                let inline = record.block_bytes();
                let len = (budget.min(record.size()) as usize).min(inline.len());
                Ok(inline[..len].to_vec())
            }
            BlockMap::Direct(pointers) => self.copy_direct(&pointers, budget),
            BlockMap::Indirect { direct, single, .. } => {
                if budget > DIRECT_POINTERS as u64 * block_size {
                    return Err(RecoveryError::unsupported(format!(
                        "{} bytes need indirect block {} to be followed",
                        budget, single
                    )));
                }
                self.copy_direct(&direct, budget)
            }
            BlockMap::ExtentLeaf(extents) => {
                let mut extents = extents;
                extents.sort_by_key(|e| e.logical_block);
                // A hole can't reach past the device plus everything the record maps
                let mapped: u64 = extents.iter().map(|e| e.len() as u64 * block_size).sum();
                let fill_limit = self.device.size().saturating_add(mapped);
                let mut out = Vec::new();

                for extent in extents {
                    let logical_start = extent.logical_block as u64 * block_size;
                    if logical_start >= budget {
                        break;
                    }
                    if logical_start > fill_limit {
                        return Err(RecoveryError::invalid(format!(
                            "extent at logical block {} starts beyond {} bytes",
                            extent.logical_block, fill_limit
                        )));
                    }
                    // Holes between extents read as zeros
                    if (out.len() as u64) < logical_start {
                        zero_fill(&mut out, logical_start)?;
                    }
                    for i in 0..extent.len() as u64 {
                        let remaining = budget.saturating_sub(out.len() as u64);
                        if remaining == 0 {
                            break;
                        }
                        let take = remaining.min(block_size) as usize;
                        if extent.is_uninitialized() {
                            let target = (out.len() + take) as u64;
                            zero_fill(&mut out, target)?;
                        } else {
                            let data = self.read_block(extent.physical_start() + i)?;
                            out.extend_from_slice(&data[..take]);
                        }
                    }
                }
                Ok(out)
            }
            BlockMap::ExtentInternal(indexes) => Err(RecoveryError::unsupported(format!(
                "extent tree with {} index entries needs internal node traversal",
                indexes.len()
            ))),
        }
    }

    fn copy_direct(&self, pointers: &[u64], budget: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for &block in pointers {
            let remaining = budget.saturating_sub(out.len() as u64);
            if remaining == 0 {
                break;
            }
            let data = self.read_block(block)?;
            let take = remaining.min(data.len() as u64) as usize;
            out.extend_from_slice(&data[..take]);
        }
        Ok(out)
    }

    /// Resolve a record and extract its declared size
    pub fn extract_file(&self, number: u32) -> Result<Vec<u8>> {
        let record = self.resolve(number)?;
        self.extract(&record, record.size())
    }

    /// Human-readable summary of where the session's metadata came from
    pub fn recovery_report(&self) -> String {
        let sb = self.descriptor();
        let geo = &self.geometry;
        let mut report = String::new();

        let _ = writeln!(report, "ext4 Recovery Report");
        let _ = writeln!(report, "====================");
        match &self.located.source {
            None => {
                let _ = writeln!(report, "Superblock source: primary (offset {})", self.located.offset);
            }
            Some(backup) => {
                let _ = writeln!(
                    report,
                    "Superblock source: backup group {} (offset {}, {}-byte blocks)",
                    backup.group, backup.offset, backup.block_size
                );
            }
        }
        let _ = writeln!(report, "Volume name: {}", sb.volume_name());
        let _ = writeln!(report, "UUID: {}", sb.uuid().hyphenated());
        let _ = writeln!(report, "Block size: {} bytes", geo.block_size);
        let _ = writeln!(
            report,
            "Blocks: {} total, {} free, {} reserved",
            geo.total_blocks,
            sb.free_blocks(),
            sb.reserved_blocks()
        );
        let _ = writeln!(
            report,
            "Records: {} total, {} free, {} bytes each",
            geo.total_records, sb.free_inodes_count, geo.record_size
        );
        let _ = writeln!(
            report,
            "Groups: {} loaded of {} expected ({} blocks, {} records per group)",
            self.groups.len(),
            geo.group_count,
            geo.blocks_per_group,
            geo.records_per_group
        );

        let backups = if self.located.backups.is_empty() {
            find_backups(self.device, geo.block_size, geo.blocks_per_group)
        } else {
            self.located.backups.clone()
        };
        let groups: Vec<String> = backups.iter().map(|b| b.group.to_string()).collect();
        let _ = writeln!(
            report,
            "Backup superblocks: {} ({})",
            backups.len(),
            if groups.is_empty() {
                "none".to_string()
            } else {
                format!("groups {}", groups.join(", "))
            }
        );
        if let Some(created) = sb.created_time() {
            let _ = writeln!(report, "Created: {}", created.to_rfc3339());
        }
        if let Some(written) = sb.write_time() {
            let _ = writeln!(report, "Last write: {}", written.to_rfc3339());
        }
        report
    }
}

/// Grow `out` with zeros up to `len` bytes, failing instead of aborting when
/// the allocation is refused
fn zero_fill(out: &mut Vec<u8>, len: u64) -> Result<()> {
    let len = usize::try_from(len)
        .map_err(|_| RecoveryError::invalid(format!("{} bytes exceed the address space", len)))?;
    if let Some(extra) = len.checked_sub(out.len()) {
        out.try_reserve(extra).map_err(|e| {
            RecoveryError::invalid(format!("cannot allocate {} zero bytes: {}", extra, e))
        })?;
        out.resize(len, 0);
    }
    Ok(())
}
