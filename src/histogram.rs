//! Byte-frequency false-positive gate for brute-force deflate probing.
//!
//! # Problem statement
//! Brute mode probes every input position with a short inflate, which is
//! expensive. Highly redundant windows (repeated 3-byte patterns, long byte
//! runs) inflate "successfully" often enough to dominate scan time while
//! never producing an accepted stream. This gate rejects such windows from a
//! cheap byte histogram before the inflate probe runs.
//!
//! # Algorithm
//! Four consecutive 64-byte windows are tallied into one 256-bucket
//! histogram. After window `i` (0-based) the position is rejected when
//! either:
//! - `maximum >= (12 + i) << i` (some byte occurs too often), or
//! - `used * (7 - (i + i/2)) < (i + 1) * 64` (too few distinct bytes).
//!
//! Consecutive calls at `pos` then `pos + 1` on the same input reuse the
//! previous histogram: the byte that left the 256-byte span is decremented
//! and tallying resumes inside the last window reached. Any other call
//! pattern rebuilds from scratch.
//!
//! # Invariants
//! - Incremental and from-scratch evaluation agree for every position
//!   (property-tested below).
//! - The gate only ever *rejects*; passing it implies nothing beyond "worth
//!   an inflate probe".

/// Number of 64-byte windows tallied.
const WINDOWS: usize = 4;

/// Bytes per window.
const WINDOW_LEN: usize = 64;

/// Span the gate inspects.
pub const GATE_SPAN: usize = WINDOWS * WINDOW_LEN;

/// Incremental histogram gate.
///
/// One instance is owned by the brute handler and survives across scan
/// positions of one input.
#[derive(Clone, Debug)]
pub struct DeflateHistogramGate {
    histogram: [u32; 256],
    prev_input_id: u64,
    prev_pos: u64,
    prev_first_byte: u8,
    prev_used: u32,
    prev_window: usize,
    primed: bool,
}

impl Default for DeflateHistogramGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DeflateHistogramGate {
    pub fn new() -> Self {
        Self {
            histogram: [0; 256],
            prev_input_id: 0,
            prev_pos: 0,
            prev_first_byte: 0,
            prev_used: 0,
            prev_window: 0,
            primed: false,
        }
    }

    /// Returns true when `window` looks plausible enough for an inflate
    /// probe at `pos`. Windows shorter than the full gate span are tallied
    /// as far as they go.
    pub fn check(&mut self, input_id: u64, window: &[u8], pos: u64) -> bool {
        let mut maximum: u32 = 0;
        let mut used: u32 = 0;
        let mut win: usize;
        let mut j: usize;

        let contiguous = self.primed
            && input_id == self.prev_input_id
            && self.prev_pos + 1 == pos
            && window.len() >= GATE_SPAN;

        if contiguous {
            // Resume from the previous call: drop the byte that left the
            // span, keep the tally up to the window we previously reached.
            win = if self.prev_window == WINDOWS {
                self.prev_window - 1
            } else {
                self.prev_window
            };
            j = WINDOW_LEN - 1;
            let first_slot = &mut self.histogram[self.prev_first_byte as usize];
            let first_was_repeated = *first_slot > 1;
            *first_slot = first_slot.saturating_sub(1);
            maximum = self.histogram.iter().copied().max().unwrap_or(0);
            used = self.prev_used;
            if !first_was_repeated {
                used = used.saturating_sub(1);
            }
        } else {
            self.histogram = [0; 256];
            win = 0;
            j = 0;
        }

        while win < WINDOWS {
            let base = win * WINDOW_LEN;
            // The incremental path re-enters mid-window at offset j relative
            // to the *shifted* data: bytes there are one past the old ones.
            while j < WINDOW_LEN {
                let Some(&b) = window.get(base + j) else {
                    break;
                };
                let freq = &mut self.histogram[b as usize];
                if *freq == 0 {
                    used += 1;
                }
                *freq += 1;
                if *freq > maximum {
                    maximum = *freq;
                }
                j += 1;
            }
            let i = win as u32;
            if maximum >= ((12 + i) << i) || used * (7 - (i + i / 2)) < (i + 1) * 64 {
                break;
            }
            if window.len() < base + WINDOW_LEN {
                // Ran out of data mid-window; treat as passed this far.
                win = WINDOWS;
                j = WINDOW_LEN;
                break;
            }
            win += 1;
            if win != WINDOWS {
                j = 0;
            }
        }

        self.prev_input_id = input_id;
        self.prev_pos = pos;
        self.prev_first_byte = window.first().copied().unwrap_or(0);
        self.prev_used = used;
        self.prev_window = win;
        self.primed = true;

        // Breaking before the final window means enough duplication was
        // found to call this a false positive.
        !(win < WINDOWS - 1 || j < WINDOW_LEN)
    }

    /// Forget all incremental state (input switch, window refill jump).
    pub fn reset(&mut self) {
        self.primed = false;
    }
}

/// Deflate BTYPE pre-check shared by the brute and intense probes.
///
/// Bits 1-2 of the first byte: `11` is reserved and always rejected; `00`
/// (stored) is rejected in brute mode only, where trivial matches would
/// flood the scan.
#[inline]
#[must_use]
pub fn btype_plausible(first_byte: u8, brute: bool) -> bool {
    let btype = (first_byte & 0x07) >> 1;
    if btype == 3 {
        return false;
    }
    !(brute && btype == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_check(window: &[u8], pos: u64) -> bool {
        DeflateHistogramGate::new().check(0, window, pos)
    }

    #[test]
    fn repeated_pattern_is_rejected() {
        // The motivating pattern from the field: 0xEB 0xE1 0xF1 repeating.
        let data: Vec<u8> = [0xEB, 0xE1, 0xF1]
            .iter()
            .copied()
            .cycle()
            .take(GATE_SPAN)
            .collect();
        assert!(!fresh_check(&data, 0));
    }

    #[test]
    fn half_window_single_byte_is_rejected() {
        let mut data = vec![0u8; GATE_SPAN];
        for (i, b) in data.iter_mut().enumerate() {
            *b = if i % 2 == 0 { 0x55 } else { i as u8 };
        }
        assert!(!fresh_check(&data, 0));
    }

    #[test]
    fn diverse_window_passes() {
        // A permutation-ish spread of byte values is as deflate-like as a
        // histogram can tell.
        let data: Vec<u8> = (0..GATE_SPAN).map(|i| (i * 37 + 11) as u8).collect();
        assert!(fresh_check(&data, 0));
    }

    #[test]
    fn incremental_matches_scratch() {
        // Pseudo-random buffer, then walk it byte by byte both ways.
        let mut state = 0x12345678u32;
        let buf: Vec<u8> = (0..GATE_SPAN + 64)
            .map(|_| {
                state = state.wrapping_mul(1103515245).wrapping_add(12345);
                (state >> 16) as u8
            })
            .collect();

        let mut incremental = DeflateHistogramGate::new();
        for pos in 0..64u64 {
            let window = &buf[pos as usize..pos as usize + GATE_SPAN];
            let inc = incremental.check(7, window, pos);
            let scratch = DeflateHistogramGate::new().check(7, window, pos);
            assert_eq!(inc, scratch, "divergence at position {pos}");
        }
    }

    #[test]
    fn input_switch_discards_state() {
        let a = vec![0xAAu8; GATE_SPAN];
        let diverse: Vec<u8> = (0..GATE_SPAN).map(|i| (i * 37 + 11) as u8).collect();
        let mut gate = DeflateHistogramGate::new();
        assert!(!gate.check(1, &a, 0));
        // Different input id at pos+1: must rebuild, not resume.
        assert!(gate.check(2, &diverse, 1));
    }

    #[test]
    fn btype_gate() {
        assert!(!btype_plausible(0b0000_0110, false)); // reserved
        assert!(!btype_plausible(0b0000_0000, true)); // stored, brute
        assert!(btype_plausible(0b0000_0000, false)); // stored, intense
        assert!(btype_plausible(0b0000_0010, true)); // static huffman
        assert!(btype_plausible(0b0000_0100, true)); // dynamic huffman
    }
}
