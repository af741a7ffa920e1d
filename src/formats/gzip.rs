//! gzip member handler.
//!
//! Walks the RFC 1952 header (optional FEXTRA/FNAME/FCOMMENT/FHCRC) to the
//! deflate start; the whole prefix is stored and reproduced verbatim. The
//! CRC32/ISIZE trailer after the deflate stream stays literal.

use std::io::{self, Write};

use crate::container::PrecompRecord;
use crate::error::Result;
use crate::formats::common::{
    attempt_deflate_family, recompress_deflate_family, DeflateAttempt,
};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::stream::InputStream;

pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const CM_DEFLATE: u8 = 8;
const FLAG_FTEXT: u8 = 0x01;
const FLAG_FHCRC: u8 = 0x02;
const FLAG_FEXTRA: u8 = 0x04;
const FLAG_FNAME: u8 = 0x08;
const FLAG_FCOMMENT: u8 = 0x10;
const FLAG_RESERVED: u8 = 0xE0;

pub struct GzipHandler;

impl GzipHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GzipHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Header length up to the deflate start, parsed from a bounded prefix.
///
/// Returns `None` when the prefix is not a gzip header or the optional
/// fields run past the window.
fn parse_header_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 10 || buf[0] != GZIP_MAGIC[0] || buf[1] != GZIP_MAGIC[1] {
        return None;
    }
    if buf[2] != CM_DEFLATE {
        return None;
    }
    let flg = buf[3];
    if flg & FLAG_RESERVED != 0 {
        return None;
    }
    let _ = FLAG_FTEXT; // informational only, no header bytes attached

    let mut idx = 10usize;
    if flg & FLAG_FEXTRA != 0 {
        if idx + 2 > buf.len() {
            return None;
        }
        let xlen = u16::from_le_bytes([buf[idx], buf[idx + 1]]) as usize;
        idx += 2 + xlen;
        if idx > buf.len() {
            return None;
        }
    }
    if flg & FLAG_FNAME != 0 {
        idx = skip_nul_terminated(buf, idx)?;
    }
    if flg & FLAG_FCOMMENT != 0 {
        idx = skip_nul_terminated(buf, idx)?;
    }
    if flg & FLAG_FHCRC != 0 {
        idx += 2;
        if idx > buf.len() {
            return None;
        }
    }
    Some(idx)
}

fn skip_nul_terminated(buf: &[u8], start: usize) -> Option<usize> {
    memchr::memchr(0, buf.get(start..)?).map(|n| start + n + 1)
}

impl FormatHandler for GzipHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Gzip]
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
                tag: FormatTag::Gzip,
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
            unreachable!("gzip handler dispatched with foreign header");
        };
        recompress_deflate_family(input, out, &hdr, b"", tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_header_is_ten_bytes() {
        let hdr = [0x1F, 0x8B, 8, 0, 0, 0, 0, 0, 0, 3, 0x78];
        assert_eq!(parse_header_len(&hdr), Some(10));
    }

    #[test]
    fn fname_extends_header() {
        let mut hdr = vec![0x1F, 0x8B, 8, FLAG_FNAME, 0, 0, 0, 0, 0, 3];
        hdr.extend_from_slice(b"file.txt\0");
        hdr.push(0x78);
        assert_eq!(parse_header_len(&hdr), Some(10 + 9));
    }

    #[test]
    fn fextra_and_fhcrc() {
        let mut hdr = vec![0x1F, 0x8B, 8, FLAG_FEXTRA | FLAG_FHCRC, 0, 0, 0, 0, 0, 3];
        hdr.extend_from_slice(&[3, 0]); // XLEN = 3
        hdr.extend_from_slice(&[9, 9, 9]);
        hdr.extend_from_slice(&[0xAB, 0xCD]); // CRC16
        assert_eq!(parse_header_len(&hdr), Some(10 + 2 + 3 + 2));
    }

    #[test]
    fn rejects_non_deflate_and_reserved() {
        assert_eq!(parse_header_len(&[0x1F, 0x8B, 7, 0, 0, 0, 0, 0, 0, 3]), None);
        assert_eq!(
            parse_header_len(&[0x1F, 0x8B, 8, 0x80, 0, 0, 0, 0, 0, 3]),
            None
        );
        // Unterminated FNAME within the window.
        let mut hdr = vec![0x1F, 0x8B, 8, FLAG_FNAME, 0, 0, 0, 0, 0, 3];
        hdr.extend_from_slice(b"noterminator");
        assert_eq!(parse_header_len(&hdr), None);
    }
}
