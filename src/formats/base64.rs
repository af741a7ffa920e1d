//! MIME base64 block handler.
//!
//! Triggers on the literal `base64` marker (the tail of a
//! `Content-Transfer-Encoding:` header). The data lines that follow are
//! decoded into the payload; the record stores only the line layout (line
//! length, count, EOL kind), so reconstruction re-encodes and re-wraps. The
//! marker itself and its EOL stay literal.
//!
//! Encode-back is verified during precompression: blocks whose exact bytes
//! the standard alphabet cannot reproduce are left alone.

use std::io::{self, Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::container::{BmpHint, PrecompRecord, RecordHeader};
use crate::error::{PrecompError, Result};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::spill::Payload;
use crate::stream::{read_exact_vec, InputStream};
use crate::vli::{read_u8, read_vli, write_vli};

const MARKER: &[u8] = b"base64";

/// Minimum decoded bytes for a block to be worth a record.
const MIN_DECODED_BYTES: usize = 64;

/// Maximum encoded block size considered (guards memory on hostile input).
const MAX_ENCODED_BYTES: usize = 256 * 1024 * 1024;

/// Line terminator kind, stable wire values.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EolKind {
    Lf = 0,
    CrLf = 1,
}

impl EolKind {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            EolKind::Lf => b"\n",
            EolKind::CrLf => b"\r\n",
        }
    }

    fn from_u8(b: u8) -> Option<EolKind> {
        match b {
            0 => Some(EolKind::Lf),
            1 => Some(EolKind::CrLf),
            _ => None,
        }
    }
}

/// Uniform line layout of an encoded block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Base64Layout {
    pub line_count: u64,
    pub line_len: u64,
    pub last_line_len: u64,
    pub eol: EolKind,
    /// Whether the final line carries its own terminator.
    pub trailing_eol: bool,
}

impl Base64Layout {
    /// Encoded span size in bytes.
    fn encoded_len(&self) -> u64 {
        if self.line_count == 0 {
            return 0;
        }
        let eol_len = self.eol.as_bytes().len() as u64;
        let full_lines = self.line_count - 1;
        full_lines * (self.line_len + eol_len)
            + self.last_line_len
            + if self.trailing_eol { eol_len } else { 0 }
    }
}

/// Parsed generic record header for base64.
#[derive(Debug)]
pub struct Base64HeaderData {
    /// Marker bytes (`base64` + EOL) reproduced verbatim.
    pub marker: Vec<u8>,
    pub layout: Base64Layout,
    pub tail: crate::container::GenericTail,
}

fn is_b64_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
}

/// Parse a uniform-layout base64 block starting at `data`.
///
/// Accepts blocks whose every full line has the same length, ending at the
/// first line that breaks the pattern. Returns the layout and the stripped
/// base64 text.
fn parse_block(data: &[u8]) -> Option<(Base64Layout, Vec<u8>)> {
    let mut lines: Vec<(usize, usize)> = Vec::new(); // (start, len)
    let mut pos = 0usize;
    let mut eol: Option<EolKind> = None;
    let mut trailing_eol = true;

    loop {
        let start = pos;
        while pos < data.len() && is_b64_char(data[pos]) {
            pos += 1;
        }
        let len = pos - start;
        if len == 0 {
            break;
        }

        let this_eol = match data.get(pos) {
            Some(b'\r') if data.get(pos + 1) == Some(&b'\n') => Some(EolKind::CrLf),
            Some(b'\n') => Some(EolKind::Lf),
            _ => None,
        };

        match (eol, this_eol) {
            (None, Some(e)) => eol = Some(e),
            (Some(prev), Some(e)) if prev != e => {
                // Mixed terminators: stop before this line.
                lines.push((start, len));
                trailing_eol = false;
                // Roll back: treat as last line without EOL.
                return finish_block(data, lines, eol?, trailing_eol);
            }
            _ => {}
        }

        lines.push((start, len));
        match this_eol {
            Some(e) => pos += e.as_bytes().len(),
            None => {
                trailing_eol = false;
                break;
            }
        }

        // A line shorter than its predecessor ends the block.
        if lines.len() >= 2 {
            let first_len = lines[0].1;
            let this = lines[lines.len() - 1];
            if this.1 != first_len {
                break;
            }
        }
        if pos >= data.len() {
            break;
        }
    }

    finish_block(data, lines, eol?, trailing_eol)
}

fn finish_block(
    data: &[u8],
    lines: Vec<(usize, usize)>,
    eol: EolKind,
    trailing_eol: bool,
) -> Option<(Base64Layout, Vec<u8>)> {
    if lines.is_empty() {
        return None;
    }
    let line_len = lines[0].1 as u64;
    // Every line but the last must match the first line's length.
    for &(_, len) in &lines[..lines.len() - 1] {
        if len as u64 != line_len {
            return None;
        }
    }
    let last = lines[lines.len() - 1];
    if last.1 as u64 > line_len {
        return None;
    }

    let mut text = Vec::with_capacity(lines.len() * line_len as usize);
    for &(start, len) in &lines {
        text.extend_from_slice(&data[start..start + len]);
    }

    Some((
        Base64Layout {
            line_count: lines.len() as u64,
            line_len,
            last_line_len: last.1 as u64,
            eol,
            trailing_eol,
        },
        text,
    ))
}

/// Re-encode a payload into the recorded layout.
fn encode_with_layout(payload: &[u8], layout: &Base64Layout) -> Vec<u8> {
    let text = STANDARD.encode(payload);
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(layout.encoded_len() as usize);
    let eol = layout.eol.as_bytes();
    let line_len = layout.line_len as usize;
    let mut pos = 0usize;
    let mut line = 0u64;
    while line < layout.line_count {
        let is_last = line + 1 == layout.line_count;
        let want = if is_last {
            layout.last_line_len as usize
        } else {
            line_len
        };
        let end = (pos + want).min(bytes.len());
        out.extend_from_slice(&bytes[pos..end]);
        pos = end;
        if !is_last || layout.trailing_eol {
            out.extend_from_slice(eol);
        }
        line += 1;
    }
    out
}

pub struct Base64Handler;

impl Base64Handler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Base64Handler {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatHandler for Base64Handler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Base64]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        window.len() > MARKER.len() + 2
            && window[..MARKER.len()].eq_ignore_ascii_case(MARKER)
            && matches!(window[MARKER.len()], b'\r' | b'\n')
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        _window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        // Read the whole candidate region after the marker's EOL.
        let mut after = pos + MARKER.len() as u64;
        ctx.input.seek_abs(after)?;
        let mut eol_probe = [0u8; 2];
        let n = ctx.input.read(&mut eol_probe)?;
        if n == 0 {
            return Ok(None);
        }
        after += if eol_probe[0] == b'\r' && n == 2 && eol_probe[1] == b'\n' {
            2
        } else {
            1
        };

        let region_len =
            (ctx.fin_length - after).min(MAX_ENCODED_BYTES as u64) as usize;
        ctx.input.seek_abs(after)?;
        let data = read_exact_vec(ctx.input, region_len)?;

        let Some((layout, text)) = parse_block(&data) else {
            return Ok(None);
        };
        let Ok(decoded) = STANDARD.decode(&text) else {
            return Ok(None);
        };
        if decoded.len() < MIN_DECODED_BYTES {
            return Ok(None);
        }
        ctx.stats.record_decompressed(FormatTag::Base64);

        // Acceptance requires exact reproduction of the encoded span.
        let reencoded = encode_with_layout(&decoded, &layout);
        let span = layout.encoded_len() as usize;
        if reencoded.len() != span || reencoded != data[..span] {
            return Ok(None);
        }
        ctx.stats.record_recompressed(FormatTag::Base64);

        let mut header = Vec::new();
        write_vli(&mut header, layout.line_count)?;
        write_vli(&mut header, layout.line_len)?;
        write_vli(&mut header, layout.last_line_len)?;
        header.push(layout.eol as u8);
        header.push(u8::from(layout.trailing_eol));

        let original_size = (after - pos) + span as u64;
        Ok(Some(PrecompRecord {
            tag: FormatTag::Base64,
            format_flag_bits: 0,
            header: RecordHeader::Generic({
                // Marker and its EOL are reproduced from stored bytes.
                let mut h = Vec::new();
                write_vli(&mut h, after - pos)?;
                ctx.input.seek_abs(pos)?;
                let marker = read_exact_vec(ctx.input, (after - pos) as usize)?;
                h.extend_from_slice(&marker);
                h.extend_from_slice(&header);
                h
            }),
            penalties: Vec::new(),
            original_size,
            precompressed_size: decoded.len() as u64,
            payload: Payload::from(decoded),
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
        let marker_len = read_vli(input)? as usize;
        let marker = read_exact_vec(input, marker_len)?;
        let line_count = read_vli(input)?;
        let line_len = read_vli(input)?;
        let last_line_len = read_vli(input)?;
        let eol = EolKind::from_u8(read_u8(input)?).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "bad base64 eol kind")
        })?;
        let trailing_eol = read_u8(input)? != 0;
        let tail = crate::container::read_generic_tail(input, flags)?;
        Ok(FormatHeaderData::Base64(Base64HeaderData {
            marker,
            layout: Base64Layout {
                line_count,
                line_len,
                last_line_len,
                eol,
                trailing_eol,
            },
            tail,
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
        let FormatHeaderData::Base64(hdr) = hdr else {
            unreachable!("base64 handler dispatched with foreign header");
        };

        out.write_all(&hdr.marker).map_err(PrecompError::Io)?;

        let payload_start = input.tell().map_err(PrecompError::Io)?;
        let decoded = match hdr.tail.recursion_length {
            Some(rec_len) => {
                let mut nested =
                    crate::recursion::recursion_decompress(input, rec_len, tools)?;
                let mut buf = Vec::with_capacity(hdr.tail.precompressed_size as usize);
                nested
                    .read_to_end(&mut buf)
                    .map_err(PrecompError::Io)?;
                nested.finish()?;
                input
                    .seek_abs(payload_start + rec_len)
                    .map_err(PrecompError::Io)?;
                buf
            }
            None => {
                read_exact_vec(input, hdr.tail.precompressed_size as usize)
                    .map_err(PrecompError::Io)?
            }
        };
        if decoded.len() as u64 != hdr.tail.precompressed_size {
            return Err(PrecompError::RecompressionFailure);
        }

        let encoded = encode_with_layout(&decoded, &hdr.layout);
        out.write_all(&encoded).map_err(PrecompError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_parses_and_reencodes() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(300).collect();
        let text = STANDARD.encode(&payload);
        let mut block = Vec::new();
        for chunk in text.as_bytes().chunks(76) {
            block.extend_from_slice(chunk);
            block.extend_from_slice(b"\r\n");
        }
        let (layout, stripped) = parse_block(&block).unwrap();
        assert_eq!(layout.eol, EolKind::CrLf);
        assert_eq!(layout.line_len, 76);
        assert!(layout.trailing_eol);
        assert_eq!(stripped, text.as_bytes());

        let decoded = STANDARD.decode(&stripped).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(encode_with_layout(&decoded, &layout), block);
    }

    #[test]
    fn unterminated_last_line() {
        let payload = vec![7u8; 100];
        let text = STANDARD.encode(&payload);
        let mut block = Vec::new();
        for chunk in text.as_bytes().chunks(40) {
            block.extend_from_slice(chunk);
            block.extend_from_slice(b"\n");
        }
        block.pop(); // drop the final newline
        let (layout, _) = parse_block(&block).unwrap();
        assert!(!layout.trailing_eol);
        let decoded = STANDARD.decode(STANDARD.encode(&payload)).unwrap();
        assert_eq!(encode_with_layout(&decoded, &layout), block);
    }

    #[test]
    fn short_line_ends_the_block() {
        let block = b"QUJDREVGR0g=\nQUJD\nQUJDREVGR0g=\n";
        // The short second line closes the block; the third line is not
        // part of it.
        let (layout, _) = parse_block(block).unwrap();
        assert_eq!(layout.line_count, 2);
        assert_eq!(layout.last_line_len, 4);
    }

    #[test]
    fn layout_encoded_len_accounts_for_eols() {
        let layout = Base64Layout {
            line_count: 3,
            line_len: 10,
            last_line_len: 4,
            eol: EolKind::CrLf,
            trailing_eol: true,
        };
        assert_eq!(layout.encoded_len(), 2 * 12 + 4 + 2);
    }
}
