//! ZIP local-file-header handler.
//!
//! Matches `PK\x03\x04` entries whose compression method is deflate. The
//! fixed 30-byte header plus filename and extra field are stored; the
//! deflate stream follows immediately. Central directory structures and data
//! descriptors stay literal.

use std::io::{self, Write};

use crate::container::PrecompRecord;
use crate::error::Result;
use crate::formats::common::{
    attempt_deflate_family, recompress_deflate_family, DeflateAttempt,
};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::stream::InputStream;

pub const ZIP_LOCAL_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const LOCAL_HEADER_LEN: usize = 30;
const METHOD_DEFLATE: u16 = 8;

pub struct ZipHandler;

impl ZipHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ZipHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Full local header length (fixed part + name + extra) for a deflate entry.
fn parse_header_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < LOCAL_HEADER_LEN || buf[..4] != ZIP_LOCAL_MAGIC {
        return None;
    }
    let method = u16::from_le_bytes([buf[8], buf[9]]);
    if method != METHOD_DEFLATE {
        return None;
    }
    let name_len = u16::from_le_bytes([buf[26], buf[27]]) as usize;
    let extra_len = u16::from_le_bytes([buf[28], buf[29]]) as usize;
    let total = LOCAL_HEADER_LEN + name_len + extra_len;
    if total > buf.len() {
        return None;
    }
    Some(total)
}

impl FormatHandler for ZipHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Zip]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        parse_header_len(window).is_some()
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        let Some(hdr_len) = parse_header_len(window) else {
            return Ok(None);
        };
        attempt_deflate_family(
            ctx,
            DeflateAttempt {
                tag: FormatTag::Zip,
                probe_pos: pos,
                deflate_pos: pos + hdr_len as u64,
                stream_hdr: window[..hdr_len].to_vec(),
                inc_last_hdr_byte: false,
                window_bits_hint: 15,
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
            unreachable!("zip handler dispatched with foreign header");
        };
        recompress_deflate_family(input, out, &hdr, b"", tools)
    }
}
