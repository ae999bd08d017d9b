/// Carving signature database
///
/// Each file type is a declarative record; the carver runs one generic
/// extraction routine parameterized by it.

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// How a footerless file's end is detected
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TailPolicy {
    /// Trailing window inspected, in blocks
    pub window_blocks: usize,
    /// Zero-byte fraction above which the file is considered finished
    pub zero_ratio: f64,
}

impl TailPolicy {
    pub const GENERAL: TailPolicy = TailPolicy {
        window_blocks: 2,
        zero_ratio: 0.8,
    };
    pub const STREAM: TailPolicy = TailPolicy {
        window_blocks: 4,
        zero_ratio: 0.9,
    };

    /// True once the trailing window of `data` is mostly zeros
    pub fn is_exhausted(&self, data: &[u8], block_size: usize) -> bool {
        let window = self.window_blocks * block_size;
        if data.len() <= window {
            return false;
        }
        let tail = &data[data.len() - window..];
        let zeros = tail.iter().filter(|&&b| b == 0).count();
        zeros as f64 > tail.len() as f64 * self.zero_ratio
    }
}

/// State handed to a footer acceptance predicate
#[derive(Debug, Clone, Copy)]
pub struct FooterContext<'a> {
    /// Everything extracted so far
    pub data: &'a [u8],
    /// Offset just past the candidate footer
    pub footer_end: usize,
    pub blocks_read: u64,
}

pub type FooterCheck = fn(&FooterContext<'_>) -> bool;

/// One carvable file type
#[derive(Clone, Copy)]
pub struct CarveSignature {
    pub name: &'static str,
    pub extension: &'static str,
    pub header: &'static [u8],
    /// Distance of the header magic from the start of the file
    pub header_offset: usize,
    pub footer: Option<&'static [u8]>,
    pub max_size: u64,
    pub min_size: u64,
    /// Footerless files read at least this many blocks before checking the tail
    pub min_blocks: u64,
    /// Bytes kept after the footer for trailing metadata
    pub footer_extra: usize,
    /// Slack kept after the footer for trailing whitespace
    pub footer_slack: usize,
    pub trim_trailing_whitespace: bool,
    pub accept_footer: FooterCheck,
    pub tail: TailPolicy,
}

impl std::fmt::Debug for CarveSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarveSignature")
            .field("name", &self.name)
            .field("header", &self.header)
            .field("footer", &self.footer)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

fn any_footer(_: &FooterContext<'_>) -> bool {
    true
}

const PADDING_WINDOW: usize = 128;
const PADDING_RATIO: f64 = 0.6;
const FORCE_ACCEPT_BLOCKS: u64 = 50;
const NEAR_END_BYTES: usize = 512;

/// JPEG data can contain FF D9 inside compressed segments. A candidate is
/// accepted when padding or another file header follows it, when it is close
/// to the end of what was read, or after many blocks.
pub fn jpeg_footer(ctx: &FooterContext<'_>) -> bool {
    let after = ctx.data.len().saturating_sub(ctx.footer_end);
    if after == 0 {
        return true;
    }

    let next = &ctx.data[ctx.footer_end..ctx.footer_end + after.min(PADDING_WINDOW)];
    let padding = next.iter().filter(|&&b| b == 0x00 || b == 0xFF).count();
    let is_padding = padding as f64 > next.len() as f64 * PADDING_RATIO;
    let is_new_file = next.len() >= 4
        && (next.starts_with(&[0xFF, 0xD8, 0xFF])
            || next.starts_with(b"\x89PNG")
            || next.starts_with(b"%PDF-"));

    is_padding || is_new_file || ctx.blocks_read > FORCE_ACCEPT_BLOCKS || after < NEAR_END_BYTES
}

const fn signature(
    name: &'static str,
    extension: &'static str,
    header: &'static [u8],
    footer: Option<&'static [u8]>,
    max_size: u64,
) -> CarveSignature {
    CarveSignature {
        name,
        extension,
        header,
        header_offset: 0,
        footer,
        max_size,
        min_size: 0,
        min_blocks: 1,
        footer_extra: 0,
        footer_slack: 0,
        trim_trailing_whitespace: false,
        accept_footer: any_footer,
        tail: TailPolicy::GENERAL,
    }
}

/// Signatures in match priority order
pub static CARVE_SIGNATURES: [CarveSignature; 12] = [
    CarveSignature {
        min_size: 10 * KB,
        footer_extra: 1024,
        accept_footer: jpeg_footer,
        ..signature("JPEG", ".jpg", &[0xFF, 0xD8, 0xFF], Some(&[0xFF, 0xD9]), 20 * MB)
    },
    signature(
        "PNG",
        ".png",
        b"\x89PNG\r\n\x1a\n",
        Some(b"IEND\xAE\x42\x60\x82"),
        10 * MB,
    ),
    signature("GIF", ".gif", b"GIF8", Some(&[0x00, 0x3B]), 10 * MB),
    CarveSignature {
        footer_slack: 10,
        trim_trailing_whitespace: true,
        ..signature("PDF", ".pdf", b"%PDF-", Some(b"%%EOF"), 50 * MB)
    },
    signature("ZIP", ".zip", b"PK\x03\x04", Some(b"PK\x05\x06"), 100 * MB),
    signature("GZIP", ".gz", &[0x1F, 0x8B, 0x08], None, 100 * MB),
    CarveSignature {
        min_blocks: 10,
        tail: TailPolicy::STREAM,
        ..signature("MP3", ".mp3", &[0xFF, 0xFB], None, 20 * MB)
    },
    signature("MP4", ".mp4", b"\x00\x00\x00\x18ftyp", None, 500 * MB),
    signature("AVI", ".avi", b"RIFF", None, 500 * MB),
    signature("SQLITE", ".db", b"SQLite format 3\x00", None, 100 * MB),
    signature("ELF", ".elf", b"\x7FELF", None, 50 * MB),
    CarveSignature {
        header_offset: 257,
        ..signature("TAR", ".tar", b"ustar", None, 200 * MB)
    },
];

pub fn find_signature(name: &str) -> Option<&'static CarveSignature> {
    CARVE_SIGNATURES
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
}

/// Position of the first occurrence of `needle` in `haystack`
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
