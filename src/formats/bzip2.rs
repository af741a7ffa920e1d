//! bzip2 stream handler.
//!
//! `BZh<level>` plus the block magic marks a stream. The payload is the
//! decompressed data; the header digit is enough to re-run the compressor,
//! and the penalty mechanism repairs the occasional divergence between
//! libbzip2 builds. Streams that cannot be reproduced within the budget stay
//! literal.

use std::io::{self, Read, Write};

use bzip2::{Action, Compress, Compression, Decompress, Status};

use crate::container::{BmpHint, PrecompRecord, RecordHeader};
use crate::deflate::{PenaltyAccumulator, PenaltyByte};
use crate::error::{PrecompError, Result};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::spill::{Payload, PayloadSink};
use crate::stream::InputStream;
use crate::vli::read_u8;

const BZIP2_BLOCK_MAGIC: [u8; 6] = [0x31, 0x41, 0x59, 0x26, 0x53, 0x59];
const WORK_FACTOR: u32 = 30;
const BUF_SIZE: usize = 64 * 1024;

/// Parsed generic record header for bzip2.
#[derive(Debug)]
pub struct Bzip2HeaderData {
    pub level: u8,
    pub tail: crate::container::GenericTail,
}

pub struct Bzip2Handler;

impl Bzip2Handler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Bzip2Handler {
    fn default() -> Self {
        Self::new()
    }
}

fn header_level(window: &[u8]) -> Option<u8> {
    if window.len() < 10 || &window[..3] != b"BZh" {
        return None;
    }
    let level = window[3];
    if !(b'1'..=b'9').contains(&level) {
        return None;
    }
    if window[4..10] != BZIP2_BLOCK_MAGIC {
        return None;
    }
    Some(level - b'0')
}

/// Decompress one stream from the input's current position.
///
/// Returns `(compressed_size, payload)` on a complete valid stream.
fn decode_stream(input: &mut dyn InputStream) -> io::Result<Option<(u64, Payload)>> {
    let mut de = Decompress::new(false);
    let mut sink = PayloadSink::new();
    let mut in_buf = vec![0u8; BUF_SIZE];
    let mut out_buf = vec![0u8; BUF_SIZE];
    let mut in_len = 0usize;
    let mut in_pos = 0usize;
    let mut input_done = false;

    loop {
        if in_pos == in_len && !input_done {
            in_len = input.read(&mut in_buf)?;
            in_pos = 0;
            input_done = in_len == 0;
        }

        let before_in = de.total_in();
        let before_out = de.total_out();
        let status = match de.decompress(&in_buf[in_pos..in_len], &mut out_buf) {
            Ok(status) => status,
            Err(_) => return Ok(None),
        };
        let consumed = (de.total_in() - before_in) as usize;
        let produced = (de.total_out() - before_out) as usize;
        in_pos += consumed;
        if produced != 0 {
            sink.write_all(&out_buf[..produced])?;
        }

        match status {
            Status::StreamEnd => {
                return Ok(Some((de.total_in(), sink.into_payload()?)));
            }
            _ => {
                if consumed == 0 && produced == 0 {
                    if in_pos == in_len && !input_done {
                        continue; // refill and retry
                    }
                    return Ok(None);
                }
            }
        }
    }
}

/// Recompress `payload` at `level`, feeding output through `on_chunk`.
fn drive_compress(
    level: u8,
    payload: &mut dyn Read,
    len: u64,
    on_chunk: &mut dyn FnMut(&[u8]) -> io::Result<()>,
) -> io::Result<u64> {
    let mut co = Compress::new(Compression::new(u32::from(level)), WORK_FACTOR);
    let mut in_buf = vec![0u8; BUF_SIZE];
    let mut out_buf = vec![0u8; BUF_SIZE];
    let mut remaining = len;
    let mut in_len = 0usize;
    let mut in_pos = 0usize;

    loop {
        if in_pos == in_len && remaining > 0 {
            let want = (in_buf.len() as u64).min(remaining) as usize;
            payload.read_exact(&mut in_buf[..want])?;
            in_len = want;
            in_pos = 0;
            remaining -= want as u64;
        }
        let action = if remaining == 0 && in_pos == in_len {
            Action::Finish
        } else {
            Action::Run
        };

        let before_in = co.total_in();
        let before_out = co.total_out();
        let status = co
            .compress(&in_buf[in_pos..in_len], &mut out_buf, action)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        in_pos += (co.total_in() - before_in) as usize;
        let produced = (co.total_out() - before_out) as usize;
        if produced != 0 {
            on_chunk(&out_buf[..produced])?;
        }

        if matches!(status, Status::StreamEnd) {
            return Ok(co.total_out());
        }
    }
}

/// Reencode and penalty-compare against the original span.
fn select_penalties(
    input: &mut dyn InputStream,
    stream_pos: u64,
    compressed_size: u64,
    level: u8,
    payload: &Payload,
) -> io::Result<Option<Vec<PenaltyByte>>> {
    input.seek_abs(stream_pos)?;
    let mut acc = PenaltyAccumulator::new(compressed_size);
    let mut orig_buf = vec![0u8; BUF_SIZE];
    let mut orig_len = 0usize;
    let mut orig_pos = 0usize;
    let mut overrun = false;

    let mut reader = payload.reader()?;
    let produced = drive_compress(level, &mut reader, payload.len(), &mut |chunk| {
        for &b in chunk {
            if acc.is_failed() || overrun {
                return Ok(());
            }
            if orig_pos == orig_len {
                let remaining = compressed_size
                    .saturating_sub(acc.compared())
                    .min(orig_buf.len() as u64) as usize;
                if remaining == 0 {
                    overrun = true;
                    return Ok(());
                }
                input.read_exact(&mut orig_buf[..remaining])?;
                orig_len = remaining;
                orig_pos = 0;
            }
            let orig = orig_buf[orig_pos];
            orig_pos += 1;
            acc.push_byte(orig, b);
        }
        Ok(())
    })?;

    if overrun || produced != compressed_size {
        return Ok(None);
    }
    Ok(acc.into_penalties())
}

impl FormatHandler for Bzip2Handler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Bzip2]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        header_level(window).is_some()
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        let Some(level) = header_level(window) else {
            return Ok(None);
        };
        ctx.input.seek_abs(pos)?;
        let Some((compressed_size, payload)) = decode_stream(ctx.input)? else {
            return Ok(None);
        };
        if payload.is_empty() || compressed_size < ctx.switches.min_ident_size {
            return Ok(None);
        }
        ctx.stats.record_decompressed(FormatTag::Bzip2);

        let Some(penalties) =
            select_penalties(ctx.input, pos, compressed_size, level, &payload)?
        else {
            return Ok(None);
        };
        ctx.stats.record_recompressed(FormatTag::Bzip2);

        Ok(Some(PrecompRecord {
            tag: FormatTag::Bzip2,
            format_flag_bits: 0,
            header: RecordHeader::Generic(vec![level]),
            penalties,
            original_size: compressed_size,
            precompressed_size: payload.len(),
            payload,
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
        let level = read_u8(input)?;
        if !(1..=9).contains(&level) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad bzip2 level",
            ));
        }
        let tail = crate::container::read_generic_tail(input, flags)?;
        Ok(FormatHeaderData::Bzip2(Bzip2HeaderData { level, tail }))
    }

    fn recompress(
        &self,
        input: &mut dyn InputStream,
        out: &mut dyn Write,
        hdr: FormatHeaderData,
        _tag: FormatTag,
        tools: &RecompressTools,
    ) -> Result<()> {
        let FormatHeaderData::Bzip2(hdr) = hdr else {
            unreachable!("bzip2 handler dispatched with foreign header");
        };

        let payload_start = input.tell().map_err(PrecompError::Io)?;

        // Stage the recompressed stream so penalties can patch it.
        let mut staged = PayloadSink::new();
        match hdr.tail.recursion_length {
            Some(rec_len) => {
                let mut nested =
                    crate::recursion::recursion_decompress(input, rec_len, tools)?;
                drive_compress(
                    hdr.level,
                    &mut nested,
                    hdr.tail.precompressed_size,
                    &mut |chunk| staged.write_all(chunk),
                )
                .map_err(PrecompError::Io)?;
                nested.finish()?;
                input
                    .seek_abs(payload_start + rec_len)
                    .map_err(PrecompError::Io)?;
            }
            None => {
                let mut view = crate::stream::StreamView::new(
                    input,
                    payload_start,
                    hdr.tail.precompressed_size,
                )
                .map_err(PrecompError::Io)?;
                drive_compress(
                    hdr.level,
                    &mut view,
                    hdr.tail.precompressed_size,
                    &mut |chunk| staged.write_all(chunk),
                )
                .map_err(PrecompError::Io)?;
                input
                    .seek_abs(payload_start + hdr.tail.precompressed_size)
                    .map_err(PrecompError::Io)?;
            }
        }

        let mut bytes = staged
            .into_payload()
            .map_err(PrecompError::Io)?
            .to_vec()
            .map_err(PrecompError::Io)?;
        for p in &hdr.tail.penalties {
            let off = p.offset as usize;
            if off >= bytes.len() {
                return Err(PrecompError::RecompressionFailure);
            }
            bytes[off] = p.byte;
        }
        if bytes.len() as u64 != hdr.tail.original_size {
            return Err(PrecompError::RecompressionFailure);
        }
        out.write_all(&bytes).map_err(PrecompError::Io)?;
        Ok(())
    }
}
