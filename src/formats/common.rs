//! Shared attempt/recompress path for deflate-family handlers.
//!
//! zlib, gzip, zip, pdf, png, swf, and brute all parse their wrapper, locate
//! the raw deflate start, and delegate here. The common path owns the oracle
//! invocation, acceptance policy, correlated-failure ignore-set rules, and
//! the mirror-image reconstruction during recompression.

use std::io::{self, Read, Write};

use crate::container::{BmpHint, DeflateHeader, DeflateHeaderData, PrecompRecord, RecordHeader};
use crate::deflate::{reconstruct_deflate, try_recompression};
use crate::error::{PrecompError, Result};
use crate::formats::{FormatTag, RecompressTools, ScanCtx};
use crate::recursion::recursion_decompress;
use crate::stream::{InputStream, StreamView};

/// Parameters a wrapper handler resolved before delegating.
pub struct DeflateAttempt {
    pub tag: FormatTag,
    /// Absolute position the scanner probed (start of the consumed span).
    pub probe_pos: u64,
    /// Absolute position of the raw deflate bitstream.
    pub deflate_pos: u64,
    /// Stored per-format prefix, reproduced verbatim on reconstruction.
    pub stream_hdr: Vec<u8>,
    pub inc_last_hdr_byte: bool,
    /// Window size hint from the zlib CMF byte, 15 when absent.
    pub window_bits_hint: u8,
}

/// Run the oracle at `deflate_pos` and build a record on acceptance.
///
/// On a failed attempt the correlated ignore-set rules apply: an SWF body
/// failure blacklists the raw-zlib probe two bytes earlier, and every
/// non-brute failure blacklists the brute probe at the deflate start.
pub fn attempt_deflate_family(
    ctx: &mut ScanCtx<'_>,
    attempt: DeflateAttempt,
) -> io::Result<Option<PrecompRecord>> {
    let result = try_recompression(
        ctx.deflate_codec,
        ctx.input,
        attempt.deflate_pos,
        attempt.window_bits_hint,
        ctx.switches.preflate_meta_block_size,
        ctx.switches.preflate_verify,
    )?;

    if result.uncompressed_size == 0 {
        return Ok(None);
    }
    ctx.stats.record_decompressed(attempt.tag);

    if !result.accepted {
        if attempt.tag == FormatTag::Swf && attempt.deflate_pos >= 2 {
            ctx.ignore
                .insert(FormatTag::ZlibRaw, attempt.deflate_pos - 2);
        }
        if attempt.tag != FormatTag::Brute {
            ctx.ignore.insert(FormatTag::Brute, attempt.deflate_pos);
        }
        return Ok(None);
    }

    let original_size =
        (attempt.deflate_pos - attempt.probe_pos) + result.compressed_size;
    if original_size < ctx.switches.min_ident_size {
        return Ok(None);
    }
    ctx.stats.record_recompressed(attempt.tag);

    let payload = result.payload.expect("accepted result carries payload");
    Ok(Some(PrecompRecord {
        tag: attempt.tag,
        format_flag_bits: 0,
        header: RecordHeader::Deflate(DeflateHeader {
            spec: result.spec,
            stream_hdr: attempt.stream_hdr,
            inc_last_hdr_byte: attempt.inc_last_hdr_byte,
        }),
        penalties: result.penalties,
        original_size,
        precompressed_size: result.uncompressed_size,
        payload,
        recursion_length: None,
        bmp: BmpHint::None,
    }))
}

/// Reconstruct a deflate-family record: `magic_prefix`, stored header, then
/// the reencoded stream.
///
/// The payload is consumed from `input` either directly
/// (`precompressed_size` bytes) or through the recursion passthrough
/// (`recursion_length` bytes of nested container stream). On return the
/// input is positioned exactly after the record's payload.
pub fn recompress_deflate_family(
    input: &mut dyn InputStream,
    out: &mut dyn Write,
    hdr: &DeflateHeaderData,
    magic_prefix: &[u8],
    tools: &RecompressTools,
) -> Result<()> {
    out.write_all(magic_prefix).map_err(PrecompError::Io)?;
    out.write_all(&hdr.stream_hdr).map_err(PrecompError::Io)?;
    reconstruct_deflate_payload(input, out, hdr, tools)
}

/// The payload-side half of deflate reconstruction, shared with handlers
/// that write their own prefix (multi-IDAT PNG, PDF with BMP hints).
pub fn reconstruct_deflate_payload(
    input: &mut dyn InputStream,
    out: &mut dyn Write,
    hdr: &DeflateHeaderData,
    tools: &RecompressTools,
) -> Result<()> {
    let payload_start = input.tell().map_err(PrecompError::Io)?;

    let ok = match hdr.recursion_length {
        Some(rec_len) => {
            let mut nested = recursion_decompress(input, rec_len, tools)?;
            let ok = reconstruct_deflate(
                tools.deflate_codec.as_ref(),
                &hdr.spec,
                &mut nested,
                hdr.precompressed_size,
                &hdr.penalties,
                out,
            )
            .map_err(PrecompError::Io)?;
            nested.finish()?;
            input
                .seek_abs(payload_start + rec_len)
                .map_err(PrecompError::Io)?;
            ok
        }
        None => {
            let mut view = StreamView::new(input, payload_start, hdr.precompressed_size)
                .map_err(PrecompError::Io)?;
            let ok = reconstruct_deflate(
                tools.deflate_codec.as_ref(),
                &hdr.spec,
                &mut view,
                hdr.precompressed_size,
                &hdr.penalties,
                out,
            )
            .map_err(PrecompError::Io)?;
            input
                .seek_abs(payload_start + hdr.precompressed_size)
                .map_err(PrecompError::Io)?;
            ok
        }
    };

    if !ok {
        return Err(PrecompError::RecompressionFailure);
    }
    Ok(())
}

/// Parsed header of an external-oracle record (jpeg, mp3).
#[derive(Debug)]
pub struct ExternalHeaderData {
    pub original_size: u64,
    pub precompressed_size: u64,
}

/// Validate a 2-byte zlib prefix: multiple of 31, FDICT clear, CM == 8.
#[inline]
#[must_use]
pub fn is_zlib_prefix(b0: u8, b1: u8) -> bool {
    ((u16::from(b0) << 8) | u16::from(b1)) % 31 == 0 && b1 & 0x20 == 0 && b0 & 0x0F == 8
}

/// Window-bits hint from a zlib CMF byte.
#[inline]
#[must_use]
pub fn zlib_window_bits(b0: u8) -> u8 {
    ((b0 >> 4) & 0x0F) + 8
}
