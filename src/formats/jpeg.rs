//! JPEG handler, backed by an injected codec oracle.
//!
//! The JPEG core (packJPG/brunsli-style) is an external collaborator: this
//! handler locates the SOI..EOI span, hands it to the oracle, and verifies
//! losslessness by unpacking before accepting. Without an injected codec the
//! handler is not registered.

use std::io::{self, Write};

use crate::container::{BmpHint, PrecompRecord, RecordHeader};
use crate::error::{PrecompError, Result};
use crate::formats::common::ExternalHeaderData;
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::spill::Payload;
use crate::stream::{read_exact_vec, InputStream};

/// Lossless JPEG repacker oracle.
///
/// `pack`/`unpack` must be exact inverses; `pack` may return `None` for
/// images it does not support.
pub trait JpegCodec: Send + Sync {
    fn pack(&self, jpeg: &[u8]) -> io::Result<Option<Vec<u8>>>;
    fn unpack(&self, packed: &[u8]) -> io::Result<Option<Vec<u8>>>;
}

/// Search bound for the end-of-image marker.
const MAX_JPEG_BYTES: usize = 256 * 1024 * 1024;

pub struct JpegHandler;

impl JpegHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JpegHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the EOI marker, skipping entropy-coded 0xFF fill bytes.
fn find_eoi(data: &[u8]) -> Option<usize> {
    let mut at = 2;
    while at + 1 < data.len() {
        let hit = memchr::memchr(0xFF, &data[at..])? + at;
        match data.get(hit + 1) {
            Some(0xD9) => return Some(hit + 2),
            Some(_) => at = hit + 1,
            None => return None,
        }
    }
    None
}

impl FormatHandler for JpegHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Jpeg]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        window.len() >= 3 && window[0] == 0xFF && window[1] == 0xD8 && window[2] == 0xFF
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        _window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        let Some(codec) = ctx.external.jpeg.as_ref() else {
            return Ok(None);
        };
        let region_len = (ctx.fin_length - pos).min(MAX_JPEG_BYTES as u64) as usize;
        ctx.input.seek_abs(pos)?;
        let data = read_exact_vec(ctx.input, region_len)?;
        let Some(span) = find_eoi(&data) else {
            return Ok(None);
        };
        if (span as u64) < ctx.switches.min_ident_size {
            return Ok(None);
        }

        let Some(packed) = codec.pack(&data[..span])? else {
            return Ok(None);
        };
        ctx.stats.record_decompressed(FormatTag::Jpeg);

        // The oracle must prove losslessness before the record is emitted.
        match codec.unpack(&packed)? {
            Some(back) if back == data[..span] => {}
            _ => return Ok(None),
        }
        ctx.stats.record_recompressed(FormatTag::Jpeg);

        Ok(Some(PrecompRecord {
            tag: FormatTag::Jpeg,
            format_flag_bits: 0,
            header: RecordHeader::Generic(Vec::new()),
            penalties: Vec::new(),
            original_size: span as u64,
            precompressed_size: packed.len() as u64,
            payload: Payload::from(packed),
            recursion_length: None,
            bmp: BmpHint::None,
        }))
    }

    fn read_format_header(
        &self,
        input: &mut dyn InputStream,
        flags: u8,
        _tag: FormatTag,
    ) -> io::Result<FormatHeaderData> {
        let tail = crate::container::read_generic_tail(input, flags)?;
        if tail.recursion_length.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oracle records never carry nested streams",
            ));
        }
        Ok(FormatHeaderData::External(ExternalHeaderData {
            original_size: tail.original_size,
            precompressed_size: tail.precompressed_size,
        }))
    }

    fn recompress(
        &self,
        input: &mut dyn InputStream,
        out: &mut dyn Write,
        hdr: FormatHeaderData,
        _tag: FormatTag,
        tools: &RecompressTools,
    ) -> Result<()> {
        let FormatHeaderData::External(hdr) = hdr else {
            unreachable!("jpeg handler dispatched with foreign header");
        };
        let Some(codec) = tools.external.jpeg.as_ref() else {
            return Err(PrecompError::UnsupportedStreamType(FormatTag::Jpeg.as_u8()));
        };
        let packed = read_exact_vec(input, hdr.precompressed_size as usize)
            .map_err(PrecompError::Io)?;
        let Some(original) = codec.unpack(&packed).map_err(PrecompError::Io)? else {
            return Err(PrecompError::RecompressionFailure);
        };
        if original.len() as u64 != hdr.original_size {
            return Err(PrecompError::RecompressionFailure);
        }
        out.write_all(&original).map_err(PrecompError::Io)?;
        Ok(())
    }
}
