//! GIF handler: image LZW streams expanded to index data.
//!
//! The whole GIF (header through trailer) becomes one record. Every image's
//! LZW sub-block chain is decoded into the payload; everything else (screen
//! descriptor, palettes, extensions, image descriptors, the minimum-code
//! byte) is kept as a skeleton with per-image injection offsets.
//! Reconstruction re-encodes the index streams with the canonical greedy
//! encoder and repairs residual divergence from the original encoder with
//! penalty bytes; files whose encoding the diff budget cannot absorb stay
//! literal.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::container::{BmpHint, PrecompRecord, RecordHeader};
use crate::deflate::PenaltyAccumulator;
use crate::error::{PrecompError, Result};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::spill::Payload;
use crate::stream::{read_exact_vec, InputStream};
use crate::vli::{read_u8, read_vli, write_vli};

/// Largest GIF span considered.
const MAX_GIF_BYTES: usize = 64 * 1024 * 1024;

const TRAILER: u8 = 0x3B;
const EXTENSION: u8 = 0x21;
const IMAGE_SEPARATOR: u8 = 0x2C;
const MAX_CODE: u16 = 4096;

/// One image's data chain inside a parsed GIF.
struct GifImage {
    /// Offset of the minimum-code-size byte.
    mcs_at: usize,
    min_code_size: u8,
    /// Concatenated sub-block bytes (LZW bitstream).
    lzw: Vec<u8>,
    /// End offset, one past the chain's 0 terminator.
    chain_end: usize,
}

struct GifLayout {
    /// Span length from magic through trailer.
    total_len: usize,
    images: Vec<GifImage>,
}

fn color_table_len(packed: u8) -> usize {
    if packed & 0x80 != 0 {
        3 << ((packed & 0x07) + 1)
    } else {
        0
    }
}

/// Structural parse; returns `None` on anything malformed or truncated.
fn parse_gif(data: &[u8]) -> Option<GifLayout> {
    if data.len() < 13 || (&data[..6] != b"GIF87a" && &data[..6] != b"GIF89a") {
        return None;
    }
    let mut pos = 13 + color_table_len(data[10]);
    let mut images = Vec::new();

    loop {
        match *data.get(pos)? {
            TRAILER => {
                return Some(GifLayout {
                    total_len: pos + 1,
                    images,
                });
            }
            EXTENSION => {
                pos += 2;
                pos = skip_sub_blocks(data, pos)?;
            }
            IMAGE_SEPARATOR => {
                if pos + 10 > data.len() {
                    return None;
                }
                pos += 10;
                pos += color_table_len(data[pos - 1]);
                let mcs_at = pos;
                let min_code_size = *data.get(pos)?;
                if !(2..=8).contains(&min_code_size) {
                    return None;
                }
                pos += 1;
                let mut lzw = Vec::new();
                loop {
                    let len = *data.get(pos)? as usize;
                    pos += 1;
                    if len == 0 {
                        break;
                    }
                    lzw.extend_from_slice(data.get(pos..pos + len)?);
                    pos += len;
                }
                images.push(GifImage {
                    mcs_at,
                    min_code_size,
                    lzw,
                    chain_end: pos,
                });
            }
            _ => return None,
        }
    }
}

fn skip_sub_blocks(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *data.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            return Some(pos);
        }
        pos += len;
        if pos > data.len() {
            return None;
        }
    }
}

// ----------------------------------------------------------------------------
// GIF-flavored LZW
// ----------------------------------------------------------------------------

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u32,
    bits: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            acc: 0,
            bits: 0,
        }
    }

    fn take(&mut self, width: u32) -> Option<u16> {
        while self.bits < width {
            let b = *self.data.get(self.pos)?;
            self.pos += 1;
            self.acc |= u32::from(b) << self.bits;
            self.bits += 8;
        }
        let v = (self.acc & ((1 << width) - 1)) as u16;
        self.acc >>= width;
        self.bits -= width;
        Some(v)
    }
}

struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    bits: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            acc: 0,
            bits: 0,
        }
    }

    fn put(&mut self, code: u16, width: u32) {
        self.acc |= u32::from(code) << self.bits;
        self.bits += width;
        while self.bits >= 8 {
            self.out.push((self.acc & 0xFF) as u8);
            self.acc >>= 8;
            self.bits -= 8;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bits > 0 {
            self.out.push((self.acc & 0xFF) as u8);
        }
        self.out
    }
}

/// Decode a GIF LZW bitstream into index bytes.
///
/// Code width follows the per-code running counter (not the table size):
/// the counter advances for every data code read, which keeps width changes
/// aligned with encoders that insert an entry for the first code after a
/// clear even though the decoder has nothing to add there.
fn lzw_decode(min_code_size: u8, data: &[u8]) -> Option<Vec<u8>> {
    let clear: u16 = 1 << min_code_size;
    let end: u16 = clear + 1;
    let mut width = u32::from(min_code_size) + 1;
    let mut running = u32::from(end) + 1;
    let mut dict: Vec<Vec<u8>> = (0..clear).map(|i| vec![i as u8]).collect();
    dict.push(Vec::new()); // clear
    dict.push(Vec::new()); // end
    let mut out = Vec::new();
    let mut prev: Option<u16> = None;
    let mut r = BitReader::new(data);

    loop {
        let code = r.take(width)?;
        if code == clear {
            dict.truncate(usize::from(end) + 1);
            width = u32::from(min_code_size) + 1;
            running = u32::from(end) + 1;
            prev = None;
            continue;
        }
        if code == end {
            return Some(out);
        }

        let entry: Vec<u8> = if usize::from(code) < dict.len() {
            dict[usize::from(code)].clone()
        } else if usize::from(code) == dict.len() {
            // The "cScSc" case: previous entry plus its own first byte.
            let p = dict.get(usize::from(prev?))?;
            let mut e = p.clone();
            e.push(*p.first()?);
            e
        } else {
            return None;
        };

        if let Some(p) = prev {
            if dict.len() < usize::from(MAX_CODE) {
                let mut n = dict[usize::from(p)].clone();
                n.push(entry[0]);
                dict.push(n);
            }
        }
        out.extend_from_slice(&entry);
        prev = Some(code);

        running += 1;
        if running > (1 << width) && width < 12 {
            width += 1;
        }
    }
}

/// Canonical greedy GIF LZW encoder (clear at start, clear on full table).
fn lzw_encode(min_code_size: u8, data: &[u8]) -> Vec<u8> {
    let clear: u16 = 1 << min_code_size;
    let end: u16 = clear + 1;
    let mut width = u32::from(min_code_size) + 1;
    let mut next_code = end + 1;
    let mut dict: HashMap<(u16, u8), u16> = HashMap::new();
    let mut w = BitWriter::new();

    w.put(clear, width);
    let mut iter = data.iter();
    let Some(&first) = iter.next() else {
        w.put(end, width);
        return w.finish();
    };
    let mut cur = u16::from(first);

    for &b in iter {
        if let Some(&code) = dict.get(&(cur, b)) {
            cur = code;
            continue;
        }
        w.put(cur, width);
        if next_code < MAX_CODE {
            dict.insert((cur, b), next_code);
            next_code += 1;
            if u32::from(next_code) > (1 << width) && width < 12 {
                width += 1;
            }
        } else {
            w.put(clear, width);
            width = u32::from(min_code_size) + 1;
            next_code = end + 1;
            dict.clear();
        }
        cur = u16::from(b);
    }
    w.put(cur, width);
    // The decoder advances its running counter for the final data code too;
    // mirror the width change so the end code is read at the right size.
    if next_code < MAX_CODE {
        next_code += 1;
        if u32::from(next_code) > (1 << width) && width < 12 {
            width += 1;
        }
    }
    w.put(end, width);
    w.finish()
}

/// Split an LZW bitstream into 255-byte sub-blocks plus terminator.
fn pack_sub_blocks(lzw: &[u8], out: &mut Vec<u8>) {
    for chunk in lzw.chunks(255) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out.push(0);
}

// ----------------------------------------------------------------------------
// Handler
// ----------------------------------------------------------------------------

/// Per-image reconstruction plan.
#[derive(Clone, Copy, Debug)]
pub struct GifImagePlan {
    /// Injection offset within the skeleton.
    pub skeleton_offset: u64,
    pub decoded_len: u64,
    pub min_code_size: u8,
}

/// Parsed generic record header for GIF.
pub struct GifHeaderData {
    pub skeleton: Vec<u8>,
    pub images: Vec<GifImagePlan>,
    pub tail: crate::container::GenericTail,
}

pub struct GifHandler;

impl GifHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GifHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuild the full GIF span from skeleton + per-image index data.
fn reconstruct_gif(
    skeleton: &[u8],
    images: &[GifImagePlan],
    mut payload: &[u8],
) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(skeleton.len() + payload.len() / 4);
    let mut skel_pos = 0usize;
    for img in images {
        let inject = img.skeleton_offset as usize;
        if inject < skel_pos || inject > skeleton.len() {
            return None;
        }
        out.extend_from_slice(&skeleton[skel_pos..inject]);
        skel_pos = inject;

        let n = img.decoded_len as usize;
        if n > payload.len() {
            return None;
        }
        let (indices, rest) = payload.split_at(n);
        payload = rest;
        let lzw = lzw_encode(img.min_code_size, indices);
        pack_sub_blocks(&lzw, &mut out);
    }
    if !payload.is_empty() {
        return None;
    }
    out.extend_from_slice(&skeleton[skel_pos..]);
    Some(out)
}

impl FormatHandler for GifHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Gif]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        window.len() >= 6 && (&window[..6] == b"GIF87a" || &window[..6] == b"GIF89a")
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        _window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        let region_len = (ctx.fin_length - pos).min(MAX_GIF_BYTES as u64) as usize;
        ctx.input.seek_abs(pos)?;
        let data = read_exact_vec(ctx.input, region_len)?;

        let Some(layout) = parse_gif(&data) else {
            return Ok(None);
        };
        if layout.images.is_empty()
            || (layout.total_len as u64) < ctx.switches.min_ident_size
        {
            return Ok(None);
        }

        // Decode every image; build skeleton and payload as we go.
        let mut skeleton = Vec::with_capacity(layout.total_len / 2);
        let mut payload = Vec::new();
        let mut plans = Vec::with_capacity(layout.images.len());
        let mut src_pos = 0usize;
        for img in &layout.images {
            let Some(decoded) = lzw_decode(img.min_code_size, &img.lzw) else {
                return Ok(None);
            };
            if decoded.is_empty() {
                return Ok(None);
            }
            // Skeleton keeps everything through the min-code byte.
            skeleton.extend_from_slice(&data[src_pos..=img.mcs_at]);
            src_pos = img.chain_end;
            plans.push(GifImagePlan {
                skeleton_offset: skeleton.len() as u64,
                decoded_len: decoded.len() as u64,
                min_code_size: img.min_code_size,
            });
            payload.extend_from_slice(&decoded);
        }
        skeleton.extend_from_slice(&data[src_pos..layout.total_len]);
        ctx.stats.record_decompressed(FormatTag::Gif);

        // Acceptance: reconstruction plus penalty diff reproduces the span.
        let Some(rebuilt) = reconstruct_gif(&skeleton, &plans, &payload) else {
            return Ok(None);
        };
        if rebuilt.len() != layout.total_len {
            return Ok(None);
        }
        let mut acc = PenaltyAccumulator::new(layout.total_len as u64);
        for (&orig, &re) in data[..layout.total_len].iter().zip(rebuilt.iter()) {
            if !acc.push_byte(orig, re) {
                break;
            }
        }
        let Some(penalties) = acc.into_penalties() else {
            return Ok(None);
        };
        ctx.stats.record_recompressed(FormatTag::Gif);

        let mut header = Vec::new();
        write_vli(&mut header, skeleton.len() as u64)?;
        header.extend_from_slice(&skeleton);
        write_vli(&mut header, plans.len() as u64)?;
        for p in &plans {
            write_vli(&mut header, p.skeleton_offset)?;
            write_vli(&mut header, p.decoded_len)?;
            header.push(p.min_code_size);
        }

        Ok(Some(PrecompRecord {
            tag: FormatTag::Gif,
            format_flag_bits: 0,
            header: RecordHeader::Generic(header),
            penalties,
            original_size: layout.total_len as u64,
            precompressed_size: payload.len() as u64,
            payload: Payload::from(payload),
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
        let skeleton_len = read_vli(input)? as usize;
        let skeleton = read_exact_vec(input, skeleton_len)?;
        let count = read_vli(input)? as usize;
        let mut images = Vec::with_capacity(count);
        for _ in 0..count {
            let skeleton_offset = read_vli(input)?;
            let decoded_len = read_vli(input)?;
            let min_code_size = read_u8(input)?;
            images.push(GifImagePlan {
                skeleton_offset,
                decoded_len,
                min_code_size,
            });
        }
        let tail = crate::container::read_generic_tail(input, flags)?;
        Ok(FormatHeaderData::Gif(GifHeaderData {
            skeleton,
            images,
            tail,
        }))
    }

    fn recompress(
        &self,
        input: &mut dyn InputStream,
        out: &mut dyn Write,
        hdr: FormatHeaderData,
        _tag: FormatTag,
        _tools: &RecompressTools,
    ) -> Result<()> {
        let FormatHeaderData::Gif(hdr) = hdr else {
            unreachable!("gif handler dispatched with foreign header");
        };
        if hdr.tail.recursion_length.is_some() {
            // GIF payloads are index data; they are never nested streams.
            return Err(PrecompError::RecompressionFailure);
        }
        let payload = read_exact_vec(input, hdr.tail.precompressed_size as usize)
            .map_err(PrecompError::Io)?;
        let Some(mut rebuilt) = reconstruct_gif(&hdr.skeleton, &hdr.images, &payload) else {
            return Err(PrecompError::RecompressionFailure);
        };
        for p in &hdr.tail.penalties {
            let off = p.offset as usize;
            if off >= rebuilt.len() {
                return Err(PrecompError::RecompressionFailure);
            }
            rebuilt[off] = p.byte;
        }
        if rebuilt.len() as u64 != hdr.tail.original_size {
            return Err(PrecompError::RecompressionFailure);
        }
        out.write_all(&rebuilt).map_err(PrecompError::Io)?;
        Ok(())
    }
}
