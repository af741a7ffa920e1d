//! Raw zlib handler (intense mode).
//!
//! Probes every position for a plausible 2-byte zlib prefix, then runs a
//! short inflate probe before committing to the full oracle attempt. The
//! stored header is exactly the two prefix bytes; the Adler-32 trailer stays
//! literal.

use std::io::{self, Write};

use crate::container::PrecompRecord;
use crate::error::Result;
use crate::formats::common::{
    attempt_deflate_family, is_zlib_prefix, recompress_deflate_family, zlib_window_bits,
    DeflateAttempt,
};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::histogram::btype_plausible;
use crate::stream::InputStream;

pub struct ZlibHandler;

impl ZlibHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ZlibHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatHandler for ZlibHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::ZlibRaw]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        window.len() >= 3
            && is_zlib_prefix(window[0], window[1])
            && btype_plausible(window[2], false)
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        attempt_deflate_family(
            ctx,
            DeflateAttempt {
                tag: FormatTag::ZlibRaw,
                probe_pos: pos,
                deflate_pos: pos + 2,
                stream_hdr: window[..2].to_vec(),
                inc_last_hdr_byte: false,
                window_bits_hint: zlib_window_bits(window[0]),
            },
        )
    }

    fn read_format_header(
        &self,
        input: &mut dyn InputStream,
        flags: u8,
        _tag: FormatTag,
    ) -> io::Result<FormatHeaderData> {
        Ok(FormatHeaderData::Deflate(
            crate::container::read_deflate_header(input, flags, false, true)?,
        ))
    }

    fn recompress(
        &self,
        input: &mut dyn InputStream,
        out: &mut dyn Write,
        hdr: FormatHeaderData,
        _tag: FormatTag,
        tools: &RecompressTools,
    ) -> Result<()> {
        let FormatHeaderData::Deflate(hdr) = hdr else {
            unreachable!("zlib handler dispatched with foreign header");
        };
        recompress_deflate_family(input, out, &hdr, b"", tools)
    }
}
