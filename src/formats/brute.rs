//! Brute-force raw deflate handler.
//!
//! Probes every position with no signature at all, so the false-positive
//! defenses do the heavy lifting: BTYPE pre-check (reserved always, stored
//! blocks too), the incremental byte-frequency histogram gate, and a short
//! inflate probe with a high output floor.

use std::io::{self, Write};

use crate::container::PrecompRecord;
use crate::deflate::inflate_probe;
use crate::error::Result;
use crate::formats::common::{
    attempt_deflate_family, recompress_deflate_family, DeflateAttempt,
};
use crate::formats::{FormatHandler, FormatHeaderData, FormatTag, RecompressTools, ScanCtx};
use crate::histogram::{btype_plausible, DeflateHistogramGate};
use crate::stream::InputStream;

/// Complete streams shorter than this are dismissed as noise.
const BRUTE_PROBE_MIN_OUT: usize = 1024;

pub struct BruteHandler {
    gate: DeflateHistogramGate,
}

impl BruteHandler {
    pub fn new() -> Self {
        Self {
            gate: DeflateHistogramGate::new(),
        }
    }
}

impl Default for BruteHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatHandler for BruteHandler {
    fn tags(&self) -> &'static [FormatTag] {
        &[FormatTag::Brute]
    }

    fn quick_check(&mut self, window: &[u8], input_id: u64, pos: u64) -> bool {
        if window.is_empty() || !btype_plausible(window[0], true) {
            return false;
        }
        self.gate.check(input_id, window, pos) && inflate_probe(window, BRUTE_PROBE_MIN_OUT)
    }

    fn attempt(
        &mut self,
        ctx: &mut ScanCtx<'_>,
        _window: &[u8],
        pos: u64,
    ) -> io::Result<Option<PrecompRecord>> {
        attempt_deflate_family(
            ctx,
            DeflateAttempt {
                tag: FormatTag::Brute,
                probe_pos: pos,
                deflate_pos: pos,
                stream_hdr: Vec::new(),
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
            unreachable!("brute handler dispatched with foreign header");
        };
        recompress_deflate_family(input, out, &hdr, b"", tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;

    fn raw_deflate(data: &[u8], level: u32) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::new(level));
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// Byte-diverse filler that the histogram gate waves through.
    fn diverse_tail(len: usize) -> impl Iterator<Item = u8> {
        (0..len).map(|i| (i * 37 + 11) as u8)
    }

    fn check(window: &[u8]) -> bool {
        // Fresh handler per call: positions are unrelated, so the gate must
        // not resume incrementally across cases.
        BruteHandler::new().quick_check(window, 1, 0)
    }

    #[test]
    fn reserved_btype_is_rejected_before_any_probe() {
        let mut window: Vec<u8> = vec![0b0000_0110];
        window.extend(diverse_tail(512));
        assert!(!check(&window));
    }

    #[test]
    fn stored_blocks_are_rejected_in_brute_mode() {
        let mut window: Vec<u8> = vec![0b0000_0000];
        window.extend(diverse_tail(512));
        assert!(!check(&window));
    }

    #[test]
    fn gate_pass_still_requires_probe_output() {
        // A complete-but-tiny deflate stream inside an otherwise diverse
        // window: the histogram gate passes, the inflate probe's output
        // floor rejects it.
        let mut window = raw_deflate(b"hi", 6);
        let fill = 4096 - window.len();
        window.extend(diverse_tail(fill));

        let mut gate = crate::histogram::DeflateHistogramGate::new();
        assert!(gate.check(1, &window, 0), "gate must not be the rejector");
        assert!(!check(&window));
    }

    #[test]
    fn long_stream_passes_the_full_check() {
        // Mildly compressible data whose stream is far longer than the
        // probe input: the stream is still open when the probe runs out,
        // which is exactly the plausible case.
        let mut state = 0x1234_5678u32;
        let data: Vec<u8> = (0..200_000)
            .map(|i| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                if i % 4 == 0 {
                    b'x'
                } else {
                    (state >> 24) as u8
                }
            })
            .collect();
        let window = raw_deflate(&data, 6);
        assert!(window.len() > 4096, "stream must outlast the probe");
        assert!(check(&window));
    }

    #[test]
    fn redundant_window_is_rejected_by_the_gate() {
        let window: Vec<u8> = [0xEB, 0xE1, 0xF1]
            .iter()
            .copied()
            .cycle()
            .take(4096)
            .collect();
        assert!(!check(&window));
    }
}
