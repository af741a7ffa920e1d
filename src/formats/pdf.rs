//! PDF `/FlateDecode` stream handler.
//!
//! Matches the `/FlateDecode` keyword, finds the subsequent `stream` marker
//! and its EOL, and validates the zlib prefix before delegating to the
//! deflate path. The stored header covers everything between the keyword's
//! end and the deflate start; recompression re-emits the keyword itself.
//!
//! When `pdf_bmp_mode` is on and the surrounding dictionary declares an
//! 8-bits-per-component image whose expanded size matches `w*h` or `w*h*3`,
//! the record carries a BMP hint: the container wraps the payload in a
//! synthetic BMP header with 4-byte-aligned rows so downstream compressors
//! see a real image, and recompression strips both again.

use std::io::{self, Read, Write};

use memchr::memmem;

use crate::container::{
    bmp_padded_len, pdf_bmp_bits, BmpHint, PrecompRecord, FLAG_PDF_BMP_8BPP,
};
use crate::error::{PrecompError, Result};
use crate::formats::common::{
    attempt_deflate_family, is_zlib_prefix, reconstruct_deflate_payload, zlib_window_bits,
    DeflateAttempt,
};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::stream::{InputStream, StreamView};

const PDF_MAGIC: &[u8] = b"/FlateDecode";
const BMP_HEADER_CORE: usize = 54;
const BMP_PALETTE: usize = 1024;

/// How far back the dictionary scan looks for image geometry.
const DICT_LOOKBACK: usize = 4096;

pub struct PdfHandler;

impl PdfHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Located stream layout: prefix length from the probe position to the raw
/// deflate bitstream, with the zlib CMF byte for the window hint.
struct StreamStart {
    header_len: usize,
    cmf: u8,
    /// Offset of the `stream` keyword inside the window.
    stream_kw_pos: usize,
}

fn locate_stream_start(window: &[u8]) -> Option<StreamStart> {
    if window.len() < PDF_MAGIC.len() || &window[..PDF_MAGIC.len()] != PDF_MAGIC {
        return None;
    }
    let kw = memmem::find(&window[PDF_MAGIC.len()..], b"stream")? + PDF_MAGIC.len();

    let first_eol = *window.get(kw + 6)?;
    if first_eol != b'\r' && first_eol != b'\n' {
        return None;
    }
    let second = *window.get(kw + 7)?;
    let data_at = if second == b'\r' || second == b'\n' {
        kw + 8
    } else {
        kw + 7
    };
    let b0 = *window.get(data_at)?;
    let b1 = *window.get(data_at + 1)?;
    if !is_zlib_prefix(b0, b1) {
        return None;
    }
    Some(StreamStart {
        header_len: data_at + 2,
        cmf: b0,
        stream_kw_pos: kw,
    })
}

/// Parse `/Key <int>` out of a dictionary slice.
fn dict_int(dict: &[u8], key: &[u8]) -> Option<u32> {
    let at = memmem::find(dict, key)? + key.len();
    let mut val: u32 = 0;
    let mut seen_digit = false;
    for &b in dict.get(at..)? {
        match b {
            b'0'..=b'9' => {
                seen_digit = true;
                val = val.checked_mul(10)?.checked_add(u32::from(b - b'0'))?;
            }
            b' ' => {
                if seen_digit {
                    break;
                }
            }
            _ => break,
        }
    }
    seen_digit.then_some(val)
}

/// Image geometry from the dictionary preceding the stream keyword.
fn image_geometry(
    input: &mut dyn InputStream,
    pos: u64,
    stream_kw_pos: usize,
) -> io::Result<Option<(u32, u32, u32)>> {
    let kw_abs = pos + stream_kw_pos as u64;
    let lookback = kw_abs.min(DICT_LOOKBACK as u64);
    input.seek_abs(kw_abs - lookback)?;
    let mut buf = vec![0u8; lookback as usize];
    input.read_exact(&mut buf)?;

    // The innermost dictionary open nearest the stream wins.
    let Some(dict_start) = memmem::rfind(&buf, b"<<") else {
        return Ok(None);
    };
    let dict = &buf[dict_start..];
    let (Some(w), Some(h), Some(bpc)) = (
        dict_int(dict, b"/Width"),
        dict_int(dict, b"/Height"),
        dict_int(dict, b"/BitsPerComponent"),
    ) else {
        return Ok(None);
    };
    if w == 0 || h == 0 {
        return Ok(None);
    }
    Ok(Some((w, h, bpc)))
}

impl FormatHandler for PdfHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Pdf]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        window.len() >= PDF_MAGIC.len() && &window[..PDF_MAGIC.len()] == PDF_MAGIC
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        let Some(start) = locate_stream_start(window) else {
            return Ok(None);
        };

        let geometry = if ctx.switches.pdf_bmp_mode {
            image_geometry(ctx.input, pos, start.stream_kw_pos)?
        } else {
            None
        };
        let bpc8 = matches!(geometry, Some((_, _, 8)));
        if bpc8 {
            ctx.stats.decompressed_pdf_8_bit = ctx.stats.decompressed_pdf_8_bit.saturating_add(1);
        }

        let record = attempt_deflate_family(
            ctx,
            DeflateAttempt {
                tag: FormatTag::Pdf,
                probe_pos: pos,
                deflate_pos: pos + start.header_len as u64,
                stream_hdr: window[PDF_MAGIC.len()..start.header_len].to_vec(),
                inc_last_hdr_byte: false,
                window_bits_hint: zlib_window_bits(start.cmf),
            },
        )?;

        let Some(mut record) = record else {
            if bpc8 {
                ctx.stats.decompressed_pdf_8_bit =
                    ctx.stats.decompressed_pdf_8_bit.saturating_sub(1);
            }
            return Ok(None);
        };

        if let Some((w, h, 8)) = geometry {
            let size = record.precompressed_size;
            if size == u64::from(w) * u64::from(h) {
                record.bmp = BmpHint::Bpp8 {
                    width: w,
                    height: h,
                };
                record.format_flag_bits = record.bmp.flag_bits();
                ctx.stats.reclassify_pdf_8bpp();
            } else if size == u64::from(w) * u64::from(h) * 3 {
                record.bmp = BmpHint::Bpp24 {
                    width: w,
                    height: h,
                };
                record.format_flag_bits = record.bmp.flag_bits();
                ctx.stats.reclassify_pdf_24bpp();
            } else {
                // Geometry did not match the stream after all.
                ctx.stats.decompressed_pdf_8_bit =
                    ctx.stats.decompressed_pdf_8_bit.saturating_sub(1);
            }
        }
        Ok(Some(record))
    }

    fn read_format_header(
        &self,
        input: &mut dyn InputStream,
        flags: u8,
        _tag: FormatTag,
    ) -> io::Result<FormatHeaderData> {
        Ok(FormatHeaderData::Deflate(
            crate::container::read_deflate_header(input, flags, false, false)?,
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
            unreachable!("pdf handler dispatched with foreign header");
        };
        out.write_all(PDF_MAGIC).map_err(PrecompError::Io)?;
        out.write_all(&hdr.stream_hdr).map_err(PrecompError::Io)?;

        let bmp_bits = pdf_bmp_bits(hdr.flags);
        if bmp_bits == 0 {
            return reconstruct_deflate_payload(input, out, &hdr, tools);
        }

        // Skip the synthetic BMP header, extracting the geometry we need to
        // undo row padding.
        let bmp_hdr_len = if bmp_bits == FLAG_PDF_BMP_8BPP {
            BMP_HEADER_CORE + BMP_PALETTE
        } else {
            BMP_HEADER_CORE
        };
        let mut bmp_hdr = vec![0u8; bmp_hdr_len];
        input.read_exact(&mut bmp_hdr).map_err(PrecompError::Io)?;
        let width = u32::from_le_bytes([bmp_hdr[18], bmp_hdr[19], bmp_hdr[20], bmp_hdr[21]]);
        let height = u32::from_le_bytes([bmp_hdr[22], bmp_hdr[23], bmp_hdr[24], bmp_hdr[25]]);
        let hint = if bmp_bits == FLAG_PDF_BMP_8BPP {
            BmpHint::Bpp8 { width, height }
        } else {
            BmpHint::Bpp24 { width, height }
        };

        let padded_len = bmp_padded_len(hint, hdr.precompressed_size);
        let payload_start = input.tell().map_err(PrecompError::Io)?;
        let width_bytes = hint.width_bytes();

        let ok = {
            let view = StreamView::new(input, payload_start, padded_len)
                .map_err(PrecompError::Io)?;
            let mut rows = RowUnpadReader::new(view, width_bytes);
            crate::deflate::reconstruct_deflate(
                tools.deflate_codec.as_ref(),
                &hdr.spec,
                &mut rows,
                hdr.precompressed_size,
                &hdr.penalties,
                out,
            )
            .map_err(PrecompError::Io)?
        };
        input
            .seek_abs(payload_start + padded_len)
            .map_err(PrecompError::Io)?;
        if !ok {
            return Err(PrecompError::RecompressionFailure);
        }
        Ok(())
    }
}

/// Reader that strips BMP row padding: yields `row_len` bytes, discards the
/// alignment filler, repeats.
struct RowUnpadReader<R: Read> {
    inner: R,
    row_len: u64,
    pad_len: u64,
    in_row: u64,
}

impl<R: Read> RowUnpadReader<R> {
    fn new(inner: R, width_bytes: u32) -> Self {
        let row_len = u64::from(width_bytes);
        let padded = u64::from((width_bytes + 3) & !3);
        Self {
            inner,
            row_len,
            pad_len: padded - row_len,
            in_row: 0,
        }
    }
}

impl<R: Read> Read for RowUnpadReader<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.row_len == 0 || self.pad_len == 0 {
            return self.inner.read(dst);
        }
        if self.in_row == self.row_len {
            let mut skip = [0u8; 3];
            self.inner
                .read_exact(&mut skip[..self.pad_len as usize])?;
            self.in_row = 0;
        }
        let want = ((self.row_len - self.in_row).min(dst.len() as u64)) as usize;
        let n = self.inner.read(&mut dst[..want])?;
        self.in_row += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_stream_after_two_byte_eol() {
        let mut pdf = b"/FlateDecode /Length 20 >> stream\r\n".to_vec();
        let data_at = pdf.len();
        pdf.extend_from_slice(&[0x78, 0x9C, 0x03, 0x00]);
        let s = locate_stream_start(&pdf).unwrap();
        assert_eq!(s.header_len, data_at + 2);
        assert_eq!(s.cmf, 0x78);
    }

    #[test]
    fn locates_stream_after_one_byte_eol() {
        let mut pdf = b"/FlateDecode >> stream\n".to_vec();
        let data_at = pdf.len();
        pdf.extend_from_slice(&[0x78, 0x01, 0x03, 0x00]);
        let s = locate_stream_start(&pdf).unwrap();
        assert_eq!(s.header_len, data_at + 2);
    }

    #[test]
    fn rejects_missing_zlib_prefix() {
        let pdf = b"/FlateDecode >> stream\nXX\x03\x00".to_vec();
        assert!(locate_stream_start(&pdf).is_none());
    }

    #[test]
    fn dict_int_parses_with_spaces() {
        let dict = b"<< /Width  640 /Height 480 /BitsPerComponent 8 >>";
        assert_eq!(dict_int(dict, b"/Width"), Some(640));
        assert_eq!(dict_int(dict, b"/Height"), Some(480));
        assert_eq!(dict_int(dict, b"/BitsPerComponent"), Some(8));
        assert_eq!(dict_int(dict, b"/Missing"), None);
    }

    #[test]
    fn row_unpad_reader_strips_padding() {
        // Two 3-byte rows padded to 4.
        let padded = vec![1, 2, 3, 0, 4, 5, 6, 0];
        let mut r = RowUnpadReader::new(&padded[..], 3);
        let mut out = Vec::new();
        let mut buf = [0u8; 2];
        loop {
            match r.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }
}
