//! MP3 handler, backed by an injected codec oracle.
//!
//! Locates a run of consecutive valid MPEG-1 Layer III frames and hands the
//! span to the external repacker (packMP3-style). Losslessness is verified
//! by unpacking before the record is emitted. Without an injected codec the
//! handler is not registered.

use std::io::{self, Write};

use crate::container::{BmpHint, PrecompRecord, RecordHeader};
use crate::error::{PrecompError, Result};
use crate::formats::common::ExternalHeaderData;
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::spill::Payload;
use crate::stream::{read_exact_vec, InputStream};

/// Lossless MP3 repacker oracle.
pub trait Mp3Codec: Send + Sync {
    fn pack(&self, frames: &[u8]) -> io::Result<Option<Vec<u8>>>;
    fn unpack(&self, packed: &[u8]) -> io::Result<Option<Vec<u8>>>;
}

/// Bound on the frame-run span considered.
const MAX_MP3_BYTES: usize = 256 * 1024 * 1024;

/// Minimum consecutive frames before the oracle is consulted.
const MIN_FRAMES: usize = 4;

/// MPEG-1 Layer III bitrates (kbit/s), index 1..=14.
const BITRATES: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];

/// MPEG-1 sample rates (Hz).
const SAMPLE_RATES: [u32; 4] = [44100, 48000, 32000, 0];

pub struct Mp3Handler;

impl Mp3Handler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Mp3Handler {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame length from a 4-byte MPEG-1 Layer III header, or `None`.
fn frame_len(hdr: &[u8]) -> Option<usize> {
    if hdr.len() < 4 || hdr[0] != 0xFF || hdr[1] & 0xFE != 0xFA {
        // Sync + MPEG-1 + Layer III + no-CRC/CRC bit free.
        return None;
    }
    let bitrate_idx = (hdr[2] >> 4) as usize;
    let samplerate_idx = ((hdr[2] >> 2) & 0x03) as usize;
    let padding = u32::from((hdr[2] >> 1) & 0x01);
    let bitrate = BITRATES[bitrate_idx];
    let samplerate = SAMPLE_RATES[samplerate_idx];
    if bitrate == 0 || samplerate == 0 {
        return None;
    }
    Some((144_000 * bitrate / samplerate + padding) as usize)
}

/// Length of the longest run of back-to-back valid frames from offset 0.
fn frame_run(data: &[u8]) -> (usize, usize) {
    let mut pos = 0usize;
    let mut frames = 0usize;
    while let Some(len) = frame_len(&data[pos.min(data.len())..]) {
        if pos + len > data.len() {
            break;
        }
        pos += len;
        frames += 1;
    }
    (pos, frames)
}

impl FormatHandler for Mp3Handler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Mp3]
    }

    fn quick_check(&mut self, window: &[u8], _input_id: u64, _pos: u64) -> bool {
        frame_len(window).is_some()
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        _window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        let Some(codec) = ctx.external.mp3.as_ref() else {
            return Ok(None);
        };
        let region_len = (ctx.fin_length - pos).min(MAX_MP3_BYTES as u64) as usize;
        ctx.input.seek_abs(pos)?;
        let data = read_exact_vec(ctx.input, region_len)?;
        let (span, frames) = frame_run(&data);
        if frames < MIN_FRAMES || (span as u64) < ctx.switches.min_ident_size {
            return Ok(None);
        }

        let Some(packed) = codec.pack(&data[..span])? else {
            return Ok(None);
        };
        ctx.stats.record_decompressed(FormatTag::Mp3);

        match codec.unpack(&packed)? {
            Some(back) if back == data[..span] => {}
            _ => return Ok(None),
        }
        ctx.stats.record_recompressed(FormatTag::Mp3);

        Ok(Some(PrecompRecord {
            tag: FormatTag::Mp3,
            format_flag_bits: 0,
            header: RecordHeader::Generic(Vec::new()),
            penalties: Vec::new(),
            original_size: span as u64,
            precompressed_size: packed.len() as u64,
            payload: Payload::from(packed),
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
        let tail = crate::container::read_generic_tail(input, flags)?;
        if tail.recursion_length.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oracle records never carry nested streams",
            ));
        }
        Ok(FormatHeaderData::External(ExternalHeaderData {
            original_size: tail.original_size,
            precompressed_size: tail.precompressed_size,
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
        let FormatHeaderData::External(hdr) = hdr else {
            unreachable!("mp3 handler dispatched with foreign header");
        };
        let Some(codec) = tools.external.mp3.as_ref() else {
            return Err(PrecompError::UnsupportedStreamType(FormatTag::Mp3.as_u8()));
        };
        let packed = read_exact_vec(input, hdr.precompressed_size as usize)
            .map_err(PrecompError::Io)?;
        let Some(original) = codec.unpack(&packed).map_err(PrecompError::Io)? else {
            return Err(PrecompError::RecompressionFailure);
        };
        if original.len() as u64 != hdr.original_size {
            return Err(PrecompError::RecompressionFailure);
        }
        out.write_all(&original).map_err(PrecompError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 128 kbit/s, 44.1 kHz, no padding: 417-byte frames.
    fn frame(padding: bool) -> Vec<u8> {
        let mut f = vec![0xFF, 0xFA, 0x90 | u8::from(padding) << 1, 0x00];
        let len = frame_len(&f).unwrap();
        f.resize(len, 0xAB);
        f
    }

    #[test]
    fn frame_length_table() {
        assert_eq!(frame_len(&[0xFF, 0xFA, 0x90, 0x00]), Some(417));
        assert_eq!(frame_len(&[0xFF, 0xFA, 0x92, 0x00]), Some(418)); // padded
        assert_eq!(frame_len(&[0xFF, 0xFA, 0xF0, 0x00]), None); // bad bitrate
        assert_eq!(frame_len(&[0xFF, 0xE2, 0x90, 0x00]), None); // not MPEG-1 L3
    }

    #[test]
    fn run_counts_back_to_back_frames() {
        let mut data = Vec::new();
        for _ in 0..5 {
            data.extend_from_slice(&frame(false));
        }
        data.extend_from_slice(b"not a frame");
        let (span, frames) = frame_run(&data);
        assert_eq!(frames, 5);
        assert_eq!(span, 5 * 417);
    }
}
