//! PNG IDAT handler (single- and multi-chunk).
//!
//! The scanner lands on the `IDAT` tag. When the zlib stream ends inside the
//! first chunk's data this is an ordinary deflate-family record whose stored
//! header is the tag plus the zlib prefix. When the stream spans several
//! IDAT chunks, their data is concatenated before decoding and the record
//! header carries a chunk table (lengths plus the stored CRCs) so
//! reconstruction can re-split the reencoded stream and restore the
//! inter-chunk framing byte-exactly, even when the original CRCs were wrong.
//!
//! Chunk length fields before the probe position and the CRC following the
//! stream's final byte stay literal.

use std::io::{self, Read, Write};

use crate::container::{
    BmpHint, DeflateHeader, DeflateHeaderData, PrecompRecord, RecordHeader,
};
use crate::deflate::try_recompression;
use crate::error::{PrecompError, Result};
use crate::formats::common::{
    attempt_deflate_family, is_zlib_prefix, recompress_deflate_family,
    reconstruct_deflate_payload, zlib_window_bits, DeflateAttempt,
};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::spill::PayloadSink;
use crate::stream::InputStream;
use crate::vli::{read_vli, write_vli};

const IDAT_TAG: &[u8; 4] = b"IDAT";
/// Upper bound on chained IDAT chunks considered.
const MAX_IDAT_CHUNKS: usize = 4096;

pub struct PngHandler;

impl PngHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PngHandler {
    fn default() -> Self {
        Self::new()
    }
}

struct IdatChunk {
    /// Absolute offset of the chunk's data.
    data_start: u64,
    len: u64,
    /// CRC bytes following the data, as stored in the file.
    crc: [u8; 4],
}

/// Walk consecutive IDAT chunks starting at the tag at `pos`.
fn collect_idat_chain(
    input: &mut dyn InputStream,
    pos: u64,
    fin_length: u64,
) -> io::Result<Vec<IdatChunk>> {
    let mut chunks = Vec::new();
    input.seek_abs(pos - 4)?;
    let mut hdr = [0u8; 8];
    input.read_exact(&mut hdr)?;
    if &hdr[4..8] != IDAT_TAG {
        return Ok(chunks);
    }
    let mut len = u64::from(u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]));
    let mut data_start = pos + 4;

    loop {
        if data_start + len + 4 > fin_length {
            // Data or CRC truncated: not usable as a full chunk.
            break;
        }
        input.seek_abs(data_start + len)?;
        let mut crc = [0u8; 4];
        input.read_exact(&mut crc)?;
        chunks.push(IdatChunk {
            data_start,
            len,
            crc,
        });
        if chunks.len() >= MAX_IDAT_CHUNKS {
            break;
        }

        // Peek the next chunk header.
        if data_start + len + 4 + 8 > fin_length {
            break;
        }
        let mut next = [0u8; 8];
        input.read_exact(&mut next)?;
        if &next[4..8] != IDAT_TAG {
            break;
        }
        len = u64::from(u32::from_be_bytes([next[0], next[1], next[2], next[3]]));
        data_start = input.tell()?;
    }
    Ok(chunks)
}

impl FormatHandler for PngHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Png, FormatTag::MultiPng]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, pos: u64) -> bool {
        pos >= 4
            && window.len() >= 6
            && &window[..4] == IDAT_TAG
            && is_zlib_prefix(window[4], window[5])
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        let chunks = collect_idat_chain(ctx.input, pos, ctx.fin_length)?;
        let Some(first) = chunks.first() else {
            return Ok(None);
        };
        if first.len < 3 {
            return Ok(None);
        }

        // Concatenate chunk data; the zlib stream may cross chunk borders.
        let mut concat = PayloadSink::new();
        for c in &chunks {
            let mut view =
                crate::stream::StreamView::new(ctx.input, c.data_start, c.len)?;
            let mut remaining = c.len;
            let mut buf = [0u8; 16 * 1024];
            while remaining > 0 {
                let want = (buf.len() as u64).min(remaining) as usize;
                view.read_exact(&mut buf[..want])?;
                concat.write_all(&buf[..want])?;
                remaining -= want as u64;
            }
        }
        let concat = concat.into_payload()?;
        let mut concat_reader = concat.reader()?;

        let result = try_recompression(
            ctx.deflate_codec,
            &mut concat_reader,
            2,
            zlib_window_bits(window[4]),
            ctx.switches.preflate_meta_block_size,
            ctx.switches.preflate_verify,
        )?;

        let consumed = 2 + result.compressed_size; // zlib prefix + raw stream
        if result.uncompressed_size == 0 {
            return Ok(None);
        }

        // Where does the stream end in chunk coordinates?
        let mut k = 0usize;
        let mut r = consumed;
        while k < chunks.len() && r > chunks[k].len {
            r -= chunks[k].len;
            k += 1;
        }
        if k >= chunks.len() {
            return Ok(None);
        }

        if k == 0 {
            // Entirely inside the first chunk: plain deflate-family record.
            return attempt_deflate_family(
                ctx,
                DeflateAttempt {
                    tag: FormatTag::Png,
                    probe_pos: pos,
                    deflate_pos: pos + 6,
                    stream_hdr: {
                        let mut h = IDAT_TAG.to_vec();
                        h.extend_from_slice(&window[4..6]);
                        h
                    },
                    inc_last_hdr_byte: false,
                    window_bits_hint: zlib_window_bits(window[4]),
                },
            );
        }

        ctx.stats.record_decompressed(FormatTag::MultiPng);
        if !result.accepted {
            ctx.ignore.insert(FormatTag::Brute, pos + 6);
            return Ok(None);
        }

        let end_abs = chunks[k].data_start + r;
        let original_size = end_abs - pos;
        if original_size < ctx.switches.min_ident_size {
            return Ok(None);
        }
        ctx.stats.record_recompressed(FormatTag::MultiPng);

        // Chunk table: zlib prefix, used-chunk count, first data length,
        // then (crc of previous, length) for each following chunk.
        let mut table = Vec::new();
        table.extend_from_slice(&window[4..6]);
        write_vli(&mut table, (k + 1) as u64)?;
        write_vli(&mut table, chunks[0].len)?;
        for i in 1..=k {
            table.extend_from_slice(&chunks[i - 1].crc);
            write_vli(&mut table, chunks[i].len)?;
        }

        Ok(Some(PrecompRecord {
            tag: FormatTag::MultiPng,
            format_flag_bits: 0,
            header: RecordHeader::Deflate(DeflateHeader {
                spec: result.spec,
                stream_hdr: table,
                inc_last_hdr_byte: false,
            }),
            penalties: result.penalties,
            original_size,
            precompressed_size: result.uncompressed_size,
            payload: result.payload.expect("accepted result carries payload"),
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
        Ok(FormatHeaderData::Deflate(
            crate::container::read_deflate_header(input, flags, false, true)?,
        ))
    }

    fn recompress(
        &self,
        input: &mut dyn InputStream,
        out: &mut dyn Write,
        hdr: FormatHeaderData,
        tag: FormatTag,
        tools: &RecompressTools,
    ) -> Result<()> {
        let FormatHeaderData::Deflate(hdr) = hdr else {
            unreachable!("png handler dispatched with foreign header");
        };
        match tag {
            FormatTag::Png => recompress_deflate_family(input, out, &hdr, b"", tools),
            FormatTag::MultiPng => recompress_multi(input, out, &hdr, tools),
            _ => unreachable!("png handler dispatched with foreign tag"),
        }
    }
}

/// Rebuild a multi-IDAT span: stage the patched raw deflate stream, then
/// re-split it across the recorded chunk lengths with framing restored.
fn recompress_multi(
    input: &mut dyn InputStream,
    out: &mut dyn Write,
    hdr: &DeflateHeaderData,
    tools: &RecompressTools,
) -> Result<()> {
    // Parse the chunk table out of the stored header.
    let mut table = &hdr.stream_hdr[..];
    let mut zlib_prefix = [0u8; 2];
    table
        .read_exact(&mut zlib_prefix)
        .map_err(PrecompError::Io)?;
    let count = read_vli(&mut table).map_err(PrecompError::Io)? as usize;
    if count < 2 || count > MAX_IDAT_CHUNKS {
        return Err(PrecompError::RecompressionFailure);
    }
    let mut lens = Vec::with_capacity(count);
    let mut crcs: Vec<[u8; 4]> = Vec::with_capacity(count - 1);
    lens.push(read_vli(&mut table).map_err(PrecompError::Io)?);
    for _ in 1..count {
        let mut crc = [0u8; 4];
        table.read_exact(&mut crc).map_err(PrecompError::Io)?;
        crcs.push(crc);
        lens.push(read_vli(&mut table).map_err(PrecompError::Io)?);
    }

    // Stage the raw deflate bytes (penalties already applied).
    let mut staged = PayloadSink::new();
    reconstruct_deflate_payload(input, &mut staged, hdr, tools)?;
    let raw = staged.into_payload().map_err(PrecompError::Io)?;
    let mut raw_reader = raw.reader().map_err(PrecompError::Io)?;
    let mut remaining = raw.len() + 2; // stream bytes incl zlib prefix

    out.write_all(IDAT_TAG).map_err(PrecompError::Io)?;
    for (i, &len) in lens.iter().enumerate() {
        let take = len.min(remaining);
        if i == 0 {
            if take < 2 {
                return Err(PrecompError::RecompressionFailure);
            }
            out.write_all(&zlib_prefix).map_err(PrecompError::Io)?;
            crate::stream::fast_copy(&mut raw_reader, out, take - 2)
                .map_err(PrecompError::Io)?;
        } else {
            out.write_all(&crcs[i - 1]).map_err(PrecompError::Io)?;
            out.write_all(&(len as u32).to_be_bytes())
                .map_err(PrecompError::Io)?;
            out.write_all(IDAT_TAG).map_err(PrecompError::Io)?;
            crate::stream::fast_copy(&mut raw_reader, out, take).map_err(PrecompError::Io)?;
        }
        remaining -= take;
    }
    if remaining != 0 {
        return Err(PrecompError::RecompressionFailure);
    }
    Ok(())
}
