/// Signature-based file carving over raw blocks
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::signatures::{find_bytes, CarveSignature, FooterContext, CARVE_SIGNATURES};
use super::{ScanProgress, ScanStage};
use crate::config::CarveConfig;
use crate::error::{RecoveryError, Result};
use crate::fs::common::BlockDevice;

const TRAILING_WHITESPACE: [u8; 4] = [0, b'\n', b'\r', b' '];
const MAX_WHITESPACE_TRIM: usize = 100;
const PADDING_CHUNK: usize = 1024;
const MIN_ZERO_STREAK: usize = 2048;
const PROGRESS_INTERVAL: u64 = 1000;

/// Content recovered from raw blocks, with no record backing it
#[derive(Debug, Clone, Serialize)]
pub struct CarvedFile {
    pub signature: &'static str,
    pub extension: &'static str,
    pub start_block: u64,
    pub size: u64,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl CarvedFile {
    /// `carved_NNNN_<TYPE><ext>` for the `index`-th file (0-based)
    pub fn export_name(&self, index: usize) -> String {
        format!("carved_{:04}_{}{}", index + 1, self.signature, self.extension)
    }
}

/// Scans blocks for file headers and extracts candidate files
pub struct FileCarver {
    block_size: u32,
    config: CarveConfig,
    signatures: Vec<&'static CarveSignature>,
    progress_callback: Option<Box<dyn Fn(ScanProgress) + Send + Sync>>,
}

impl FileCarver {
    pub fn new(block_size: u32, config: CarveConfig) -> Self {
        Self {
            block_size,
            config,
            signatures: CARVE_SIGNATURES.iter().collect(),
            progress_callback: None,
        }
    }

    /// Restrict carving to the named signatures
    pub fn with_signatures(mut self, names: &[&str]) -> Result<Self> {
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let sig = super::signatures::find_signature(name)
                .ok_or_else(|| RecoveryError::not_found(format!("no signature named {}", name)))?;
            selected.push(sig);
        }
        self.signatures = selected;
        Ok(self)
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(ScanProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    fn emit_progress(&self, block: u64, start: u64, end: u64, found: usize, operation: String) {
        if let Some(ref callback) = self.progress_callback {
            callback(ScanProgress {
                stage: ScanStage::FileCarving,
                current: block - start,
                total: end - start,
                found,
                current_operation: operation,
            });
        }
    }

    /// Carve blocks `start_block..end_block` (clamped to the device). One
    /// signature match is accepted per block and blocks consumed by an
    /// extraction are skipped. Unreadable blocks are skipped.
    pub fn scan(&self, device: &BlockDevice, start_block: u64, end_block: u64) -> Vec<CarvedFile> {
        let bs = self.block_size as u64;
        let end = end_block.min(device.size() / bs);
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut block = start_block;

        info!(
            "🔍 Carving blocks {}..{} ({} signatures)",
            start_block,
            end,
            self.signatures.len()
        );

        while block < end {
            if (block - start_block) % PROGRESS_INTERVAL == 0 {
                self.emit_progress(block, start_block, end, found.len(), format!("Block {}", block));
            }

            let data = match device.read_block(block, self.block_size) {
                Ok(d) => d,
                Err(e) => {
                    warn!("⚠️ Skipping unreadable block {}: {}", block, e);
                    block += 1;
                    continue;
                }
            };

            let mut consumed = 0u64;
            for sig in &self.signatures {
                let Some(header_pos) = self.header_position(data, sig) else {
                    continue;
                };
                let Some(content) = self.extract(device, block, header_pos, sig) else {
                    continue;
                };
                if content.len() <= sig.header.len() {
                    continue;
                }

                let prefix = &content[..content.len().min(self.config.dedup_prefix)];
                let digest = Sha256::digest(prefix).to_vec();
                if !seen.insert(digest) {
                    debug!("Duplicate {} at block {}", sig.name, block);
                    continue;
                }

                debug!(
                    "📄 {} at block {} ({} bytes)",
                    sig.name,
                    block,
                    content.len()
                );
                // Content begins mid-block when the header does
                let start_offset = header_pos.saturating_sub(sig.header_offset) as u64;
                consumed = (start_offset + content.len() as u64).div_ceil(bs).max(1);
                found.push(CarvedFile {
                    signature: sig.name,
                    extension: sig.extension,
                    start_block: block,
                    size: content.len() as u64,
                    data: content,
                });
                self.emit_progress(
                    block,
                    start_block,
                    end,
                    found.len(),
                    format!("Extracted {} at block {}", sig.name, block),
                );
                break;
            }

            block += consumed.max(1);
        }

        info!("✅ Carved {} files", found.len());
        found
    }

    /// Header offset within the block when it starts inside the header window
    fn header_position(&self, data: &[u8], sig: &CarveSignature) -> Option<usize> {
        let window = (self.config.header_window + sig.header.len() - 1).min(data.len());
        find_bytes(&data[..window], sig.header)
    }

    fn extract(
        &self,
        device: &BlockDevice,
        start_block: u64,
        header_pos: usize,
        sig: &CarveSignature,
    ) -> Option<Vec<u8>> {
        let bs = self.block_size as usize;
        let max_blocks = self.config.max_blocks_per_file;
        let start_offset = header_pos.saturating_sub(sig.header_offset);
        let mut data: Vec<u8> = Vec::new();
        let mut blocks_read = 0u64;
        let mut block = start_block;
        let mut search_from = 0usize;

        while (data.len() as u64) < sig.max_size && blocks_read < max_blocks {
            let Ok(raw) = device.read_block(block, self.block_size) else {
                break;
            };
            let chunk = if blocks_read == 0 { &raw[start_offset..] } else { raw };
            data.extend_from_slice(chunk);
            blocks_read += 1;
            block += 1;

            match sig.footer {
                Some(footer) => {
                    // The window spans the previous block to catch a footer split
                    // across the boundary
                    let mut from = search_from.max(data.len().saturating_sub(chunk.len() + bs));
                    while let Some(rel) = find_bytes(&data[from..], footer) {
                        let pos = from + rel;
                        let footer_end = pos + footer.len();
                        if self.footer_accepted(sig, &data, footer_end, blocks_read) {
                            return Some(self.finish_footer(device, sig, data, footer_end, block, blocks_read));
                        }
                        debug!("Rejected {} footer candidate at offset {}", sig.name, pos);
                        search_from = pos + 1;
                        from = search_from;
                    }
                }
                None => {
                    if blocks_read < sig.min_blocks {
                        continue;
                    }
                    if sig.tail.is_exhausted(&data, bs) {
                        break;
                    }
                }
            }
        }

        if sig.footer.is_none() {
            data = trim_padding(data, sig.max_size as usize);
        }
        data.truncate(sig.max_size as usize);
        (!data.is_empty()).then_some(data)
    }

    fn footer_accepted(&self, sig: &CarveSignature, data: &[u8], footer_end: usize, blocks_read: u64) -> bool {
        if (footer_end as u64) < sig.min_size && blocks_read < self.config.min_size_block_budget {
            return false;
        }
        (sig.accept_footer)(&FooterContext {
            data,
            footer_end,
            blocks_read,
        })
    }

    fn finish_footer(
        &self,
        device: &BlockDevice,
        sig: &CarveSignature,
        mut data: Vec<u8>,
        footer_end: usize,
        next_block: u64,
        blocks_read: u64,
    ) -> Vec<u8> {
        // Pull in one more block when the trailing metadata runs past what was read
        if sig.footer_extra > 0
            && blocks_read < self.config.max_blocks_per_file
            && footer_end + sig.footer_extra > data.len()
        {
            if let Ok(extra) = device.read_block(next_block, self.block_size) {
                data.extend_from_slice(extra);
            }
        }

        let end = (footer_end + sig.footer_slack + sig.footer_extra).min(data.len());
        data.truncate(end);

        if sig.trim_trailing_whitespace {
            let mut trimmed = 0;
            while data.len() > footer_end && trimmed < MAX_WHITESPACE_TRIM {
                match data.last() {
                    Some(b) if TRAILING_WHITESPACE.contains(b) => {
                        data.pop();
                        trimmed += 1;
                    }
                    _ => break,
                }
            }
        }

        data.truncate(sig.max_size as usize);
        data
    }
}

/// Cut zero padding from a footerless file.
///
/// Oversized candidates (over half the type maximum) are cut after the last
/// 1 KiB chunk that is less than half zeros. Otherwise a trailing zero run of
/// at least 2 KiB is removed; shorter runs may be file content and are kept.
pub fn trim_padding(mut data: Vec<u8>, max_size: usize) -> Vec<u8> {
    if data.len() > max_size / 2 && data.len() > PADDING_CHUNK {
        let mut i = data.len() - PADDING_CHUNK;
        while i > 0 {
            let chunk = &data[i..(i + PADDING_CHUNK).min(data.len())];
            let zeros = chunk.iter().filter(|&&b| b == 0).count();
            if zeros < PADDING_CHUNK / 2 {
                data.truncate(i + PADDING_CHUNK);
                return data;
            }
            i = i.saturating_sub(PADDING_CHUNK);
        }
    }

    let content_end = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    if data.len() - content_end >= MIN_ZERO_STREAK {
        data.truncate(content_end);
    }
    data.truncate(max_size);
    data
}

/// Write carved files into `output_dir` as `carved_NNNN_<TYPE><ext>`.
/// Individual write failures are logged and skipped.
pub fn export_carved_files<P: AsRef<Path>>(files: &[CarvedFile], output_dir: P) -> Result<usize> {
    let dir = output_dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut exported = 0;
    for (i, file) in files.iter().enumerate() {
        let path = dir.join(file.export_name(i));
        match fs::write(&path, &file.data) {
            Ok(()) => {
                debug!("Exported {} ({} bytes)", path.display(), file.size);
                exported += 1;
            }
            Err(e) => warn!("⚠️ Failed to export {}: {}", path.display(), e),
        }
    }

    info!("💾 Exported {}/{} carved files to {}", exported, files.len(), dir.display());
    Ok(exported)
}

/// Per-type counts and total size
pub fn carve_summary(files: &[CarvedFile]) -> String {
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for file in files {
        *by_type.entry(file.signature).or_default() += 1;
    }
    let total: u64 = files.iter().map(|f| f.size).sum();

    let mut out = String::new();
    let _ = writeln!(out, "Carved files: {}", files.len());
    let _ = writeln!(out, "Total size: {} bytes", total);
    for (kind, count) in by_type {
        let _ = writeln!(out, "  {:10} {:>5}", kind, count);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 1024;

    fn device_with<T: AsRef<[u8]>>(blocks: &[(usize, T)], total_blocks: usize) -> BlockDevice {
        let mut image = vec![0u8; total_blocks * BS];
        for (block, data) in blocks {
            let data = data.as_ref();
            let offset = block * BS;
            image[offset..offset + data.len()].copy_from_slice(data);
        }
        BlockDevice::from_bytes(image)
    }

    fn carver() -> FileCarver {
        FileCarver::new(BS as u32, CarveConfig::default())
    }

    #[test]
    fn test_png_with_footer() {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend(vec![0x55u8; 1500]);
        png.extend_from_slice(b"IEND\xAE\x42\x60\x82");
        let device = device_with(&[(3, &png)], 16);

        let files = carver().scan(&device, 0, 16);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].signature, "PNG");
        assert_eq!(files[0].start_block, 3);
        assert_eq!(files[0].data, png);
    }

    #[test]
    fn test_mid_block_file_tail_not_rescanned() {
        // PNG starting 400 bytes into block 2 and ending inside block 3, with
        // a PDF magic in its body right at the start of block 3
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend(vec![0x55u8; 792]);
        png[BS - 400..BS - 400 + 5].copy_from_slice(b"%PDF-");
        png.extend_from_slice(b"IEND\xAE\x42\x60\x82");
        let mut block = vec![0u8; 400];
        block.extend_from_slice(&png);
        let device = device_with(&[(2, &block)], 8);

        let files = carver().scan(&device, 0, 8);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].signature, "PNG");
        assert_eq!(files[0].data, png);
    }

    #[test]
    fn test_header_outside_window_ignored() {
        let mut block = vec![0x20u8; 1024];
        block[600..605].copy_from_slice(b"%PDF-");
        let device = device_with(&[(1, &block)], 4);
        assert!(carver().scan(&device, 0, 4).is_empty());
    }

    #[test]
    fn test_pdf_keeps_slack_then_trims_whitespace() {
        let mut pdf = b"%PDF-1.4\n".to_vec();
        pdf.extend(vec![b'x'; 200]);
        pdf.extend_from_slice(b"%%EOF\r\n");
        let device = device_with(&[(0, &pdf)], 4);

        let files = carver().scan(&device, 0, 4);
        assert_eq!(files.len(), 1);
        assert!(files[0].data.ends_with(b"%%EOF"));
        assert_eq!(files[0].size as usize, pdf.len() - 2);
    }

    #[test]
    fn test_gzip_tail_trimmed() {
        let mut gz = vec![0x1F, 0x8B, 0x08];
        gz.extend(vec![0x77u8; 3000]);
        let device = device_with(&[(2, &gz)], 12);

        let files = carver().scan(&device, 0, 12);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].signature, "GZIP");
        assert_eq!(files[0].data, gz);
    }

    #[test]
    fn test_duplicates_suppressed() {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend(vec![0x33u8; 100]);
        png.extend_from_slice(b"IEND\xAE\x42\x60\x82");
        let device = device_with(&[(1, &png), (5, &png)], 8);
        assert_eq!(carver().scan(&device, 0, 8).len(), 1);
    }

    #[test]
    fn test_scan_is_resumable_by_range() {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend(vec![0x44u8; 100]);
        png.extend_from_slice(b"IEND\xAE\x42\x60\x82");
        let device = device_with(&[(6, &png)], 8);
        assert!(carver().scan(&device, 0, 6).is_empty());
        assert_eq!(carver().scan(&device, 6, 8).len(), 1);
    }

    #[test]
    fn test_trim_padding_keeps_short_zero_runs() {
        let mut data = vec![9u8; 100];
        data.extend(vec![0u8; 100]);
        assert_eq!(trim_padding(data.clone(), 1 << 20).len(), 200);

        data.extend(vec![0u8; 4000]);
        assert_eq!(trim_padding(data, 1 << 20).len(), 100);
    }

    #[test]
    fn test_trim_padding_oversized() {
        let mut data = vec![9u8; 3072];
        data.extend(vec![0u8; 4096]);
        // Over half the maximum: cut after the last mostly non-zero chunk
        assert_eq!(trim_padding(data, 10_000).len(), 3072);
    }

    #[test]
    fn test_export_names() {
        let tmp = tempfile::tempdir().unwrap();
        let files = vec![CarvedFile {
            signature: "PNG",
            extension: ".png",
            start_block: 3,
            size: 4,
            data: vec![1, 2, 3, 4],
        }];
        assert_eq!(export_carved_files(&files, tmp.path()).unwrap(), 1);
        assert_eq!(
            fs::read(tmp.path().join("carved_0001_PNG.png")).unwrap(),
            vec![1, 2, 3, 4]
        );
        assert!(carve_summary(&files).contains("PNG"));
    }
}
