//! SWF handler (compressed `CWS` files).
//!
//! The 8-byte SWF header (`CWS`, version, uncompressed file length) is
//! followed by a zlib stream covering the rest of the file. The stored
//! header is the 8 wrapper bytes plus the 2 zlib prefix bytes.

use std::io::{self, Write};

use crate::container::PrecompRecord;
use crate::error::Result;
use crate::formats::common::{
    attempt_deflate_family, is_zlib_prefix, recompress_deflate_family, zlib_window_bits,
    DeflateAttempt,
};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::stream::InputStream;

const SWF_WRAPPER_LEN: usize = 8;

pub struct SwfHandler;

impl SwfHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SwfHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn header_check(window: &[u8]) -> bool {
    window.len() >= SWF_WRAPPER_LEN + 2
        && window[..3] == *b"CWS"
        && is_zlib_prefix(window[SWF_WRAPPER_LEN], window[SWF_WRAPPER_LEN + 1])
}

impl FormatHandler for SwfHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Swf]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        header_check(window)
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        if !header_check(window) {
            return Ok(None);
        }
        let hdr_len = SWF_WRAPPER_LEN + 2;
        attempt_deflate_family(
            ctx,
            DeflateAttempt {
                tag: FormatTag::Swf,
                probe_pos: pos,
                deflate_pos: pos + hdr_len as u64,
                stream_hdr: window[..hdr_len].to_vec(),
                inc_last_hdr_byte: false,
                window_bits_hint: zlib_window_bits(window[SWF_WRAPPER_LEN]),
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
            unreachable!("swf handler dispatched with foreign header");
        };
        recompress_deflate_family(input, out, &hdr, b"", tools)
    }
}
