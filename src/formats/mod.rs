//! Format handlers: detection, precompression, and recompression.
//!
//! # Scope
//! The closed tag set, the handler capability trait, and the registries for
//! both scan directions. Handlers are probed in a fixed order during
//! scanning; during recompression they are selected by the record's tag.
//!
//! # Invariants
//! - `FormatTag` discriminants are stable wire bytes; new tags must be
//!   appended.
//! - Scan dispatch order is fixed: pdf, zip, gzip, png, gif, jpeg, mp3, swf,
//!   base64, bzip2, then raw zlib (intense), then brute deflate.
//! - A handler failure during `attempt` is recovered locally (the position
//!   degrades to a literal); failures during `recompress` are fatal.

pub mod base64;
pub mod brute;
pub mod bzip2;
pub mod common;
pub mod gif;
pub mod gzip;
pub mod jpeg;
pub mod mp3;
pub mod pdf;
pub mod png;
pub mod swf;
pub mod zip;
pub mod zlib;

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::Arc;

use crate::config::Switches;
use crate::container::{DeflateHeaderData, PrecompRecord};
use crate::deflate::DeflateCodec;
use crate::error::Result;
use crate::stats::Statistics;
use crate::stream::InputStream;

pub use jpeg::JpegCodec;
pub use mp3::Mp3Codec;

/// Closed set of record format tags (stable wire bytes).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Pdf = 0,
    Zip = 1,
    Gzip = 2,
    Png = 3,
    MultiPng = 4,
    Gif = 5,
    Jpeg = 6,
    Swf = 7,
    Base64 = 8,
    Bzip2 = 9,
    Mp3 = 10,
    ZlibRaw = 11,
    Brute = 12,
}

impl FormatTag {
    pub const COUNT: usize = 13;

    #[inline(always)]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub const fn from_u8(b: u8) -> Option<FormatTag> {
        Some(match b {
            0 => FormatTag::Pdf,
            1 => FormatTag::Zip,
            2 => FormatTag::Gzip,
            3 => FormatTag::Png,
            4 => FormatTag::MultiPng,
            5 => FormatTag::Gif,
            6 => FormatTag::Jpeg,
            7 => FormatTag::Swf,
            8 => FormatTag::Base64,
            9 => FormatTag::Bzip2,
            10 => FormatTag::Mp3,
            11 => FormatTag::ZlibRaw,
            12 => FormatTag::Brute,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            FormatTag::Pdf => "pdf",
            FormatTag::Zip => "zip",
            FormatTag::Gzip => "gzip",
            FormatTag::Png => "png",
            FormatTag::MultiPng => "multipng",
            FormatTag::Gif => "gif",
            FormatTag::Jpeg => "jpeg",
            FormatTag::Swf => "swf",
            FormatTag::Base64 => "base64",
            FormatTag::Bzip2 => "bzip2",
            FormatTag::Mp3 => "mp3",
            FormatTag::ZlibRaw => "zlib",
            FormatTag::Brute => "brute",
        }
    }
}

/// Per-format ignore sets: absolute offsets scanning must not probe.
///
/// Offsets are inserted by correlated-failure rules and consumed
/// monotonically as the cursor advances; `check_and_prune` drops everything
/// behind the cursor.
#[derive(Debug, Default)]
pub struct IgnoreSets {
    sets: [BTreeSet<u64>; FormatTag::COUNT],
}

impl IgnoreSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: FormatTag, pos: u64) {
        self.sets[tag.as_usize()].insert(pos);
    }

    /// Returns true when `pos` must be skipped for `tag`; prunes entries the
    /// cursor has passed.
    pub fn check_and_prune(&mut self, tag: FormatTag, pos: u64) -> bool {
        let set = &mut self.sets[tag.as_usize()];
        while let Some(&first) = set.iter().next() {
            if first < pos {
                set.remove(&first);
            } else if first == pos {
                set.remove(&first);
                return true;
            } else {
                return false;
            }
        }
        false
    }

    #[must_use]
    pub fn len(&self, tag: FormatTag) -> usize {
        self.sets[tag.as_usize()].len()
    }
}

/// Injected external codec oracles (contract-only collaborators).
#[derive(Clone, Default)]
pub struct ExternalCodecs {
    pub jpeg: Option<Arc<dyn JpegCodec>>,
    pub mp3: Option<Arc<dyn Mp3Codec>>,
}

/// Everything a handler needs while probing one position.
pub struct ScanCtx<'a> {
    pub input: &'a mut dyn InputStream,
    /// Distinguishes inputs across recursion contexts for incremental
    /// detector state.
    pub input_id: u64,
    pub fin_length: u64,
    pub switches: &'a Switches,
    pub stats: &'a mut Statistics,
    pub deflate_codec: &'a dyn DeflateCodec,
    pub external: &'a ExternalCodecs,
    pub ignore: &'a mut IgnoreSets,
}

/// Shared services for the recompression direction.
///
/// Everything is `Arc`-shared because recursion workers rebuild their own
/// registry on a separate thread.
pub struct RecompressTools {
    pub switches: Arc<Switches>,
    pub deflate_codec: Arc<dyn DeflateCodec>,
    pub external: Arc<ExternalCodecs>,
    pub recursion_depth: u32,
}

impl RecompressTools {
    #[must_use]
    pub fn nested(&self) -> RecompressTools {
        RecompressTools {
            switches: Arc::clone(&self.switches),
            deflate_codec: Arc::clone(&self.deflate_codec),
            external: Arc::clone(&self.external),
            recursion_depth: self.recursion_depth + 1,
        }
    }
}

/// Parsed format-specific record header, one variant per handler family.
pub enum FormatHeaderData {
    Deflate(DeflateHeaderData),
    Gif(gif::GifHeaderData),
    Base64(base64::Base64HeaderData),
    Bzip2(bzip2::Bzip2HeaderData),
    External(common::ExternalHeaderData),
}

/// The four-operation handler capability set.
pub trait FormatHandler {
    /// Tags this handler claims during recompression.
    fn tags(&self) -> &'static [FormatTag];

    /// Cheap signature test against the head of the sliding window.
    fn quick_check(&mut self, window: &[u8], input_id: u64, pos: u64) -> bool;

    /// Full precompression attempt; `None` backs off and the byte stays
    /// literal.
    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>>;

    /// Parse the format-specific record header during recompression.
    fn read_format_header(
        &self,
        input: &mut dyn InputStream,
        flags: u8,
        tag: FormatTag,
    ) -> io::Result<FormatHeaderData>;

    /// Regenerate the original byte span.
    fn recompress(
        &self,
        input: &mut dyn InputStream,
        out: &mut dyn Write,
        hdr: FormatHeaderData,
        tag: FormatTag,
        tools: &RecompressTools,
    ) -> Result<()>;
}

/// Build the scan-order registry for one context.
///
/// Intense and brute enablement is depth-dependent, so registries are built
/// per recursion context (construction is cheap).
pub fn build_scan_registry(
    switches: &Switches,
    recursion_depth: u32,
    external: &ExternalCodecs,
) -> Vec<Box<dyn FormatHandler>> {
    let mut handlers: Vec<Box<dyn FormatHandler>> = Vec::new();
    if switches.use_pdf {
        handlers.push(Box::new(pdf::PdfHandler::new()));
    }
    if switches.use_zip {
        handlers.push(Box::new(zip::ZipHandler::new()));
    }
    if switches.use_gzip {
        handlers.push(Box::new(gzip::GzipHandler::new()));
    }
    if switches.use_png {
        handlers.push(Box::new(png::PngHandler::new()));
    }
    if switches.use_gif {
        handlers.push(Box::new(gif::GifHandler::new()));
    }
    if switches.use_jpg && external.jpeg.is_some() {
        handlers.push(Box::new(jpeg::JpegHandler::new()));
    }
    if switches.use_mp3 && external.mp3.is_some() {
        handlers.push(Box::new(mp3::Mp3Handler::new()));
    }
    if switches.use_swf {
        handlers.push(Box::new(swf::SwfHandler::new()));
    }
    if switches.use_base64 {
        handlers.push(Box::new(base64::Base64Handler::new()));
    }
    if switches.use_bzip2 {
        handlers.push(Box::new(bzip2::Bzip2Handler::new()));
    }
    if switches.intense_mode_is_active(recursion_depth) {
        handlers.push(Box::new(zlib::ZlibHandler::new()));
    }
    if switches.brute_mode_is_active(recursion_depth) {
        handlers.push(Box::new(brute::BruteHandler::new()));
    }
    handlers
}

/// Build the tag-dispatch registry for recompression.
///
/// All handlers participate regardless of scan switches: a container stream
/// may carry any tag.
pub fn build_recompress_registry(external: &ExternalCodecs) -> Vec<Box<dyn FormatHandler>> {
    let mut handlers: Vec<Box<dyn FormatHandler>> = vec![
        Box::new(pdf::PdfHandler::new()),
        Box::new(zip::ZipHandler::new()),
        Box::new(gzip::GzipHandler::new()),
        Box::new(png::PngHandler::new()),
        Box::new(gif::GifHandler::new()),
        Box::new(swf::SwfHandler::new()),
        Box::new(base64::Base64Handler::new()),
        Box::new(bzip2::Bzip2Handler::new()),
        Box::new(zlib::ZlibHandler::new()),
        Box::new(brute::BruteHandler::new()),
    ];
    if external.jpeg.is_some() {
        handlers.push(Box::new(jpeg::JpegHandler::new()));
    }
    if external.mp3.is_some() {
        handlers.push(Box::new(mp3::Mp3Handler::new()));
    }
    handlers
}
