//! Scanning/dispatch engine (precompress direction).
//!
//! # Algorithm
//! The cursor sweeps the input byte by byte over a sliding window. At each
//! position the enabled handlers are probed in fixed order; the first whose
//! quick check and full attempt both succeed claims the span. Claimed spans
//! become records (optionally with a recursively precompressed payload);
//! everything else coalesces into literal runs.
//!
//! # Invariants
//! - Records never overlap: the cursor jumps exactly `original_size` bytes
//!   past a claimed span.
//! - A failed attempt leaves the position byte as a literal; the emitted
//!   stream is identical to one where the handler never matched.
//! - The window always covers `[cursor, cursor + CHECKBUF_SIZE)` when that
//!   much input remains.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Switches;
use crate::container::write_record;
use crate::deflate::DeflateCodec;
use crate::formats::{build_scan_registry, ExternalCodecs, FormatTag, IgnoreSets, ScanCtx};
use crate::recursion::{recursion_compress, RecursionState, MIN_RECURSION_SIZE};
use crate::stats::{ProgressRange, Statistics};
use crate::stream::{fast_copy, InputStream, ObservableSink, OutputStream};
use crate::vli::write_vli;

/// Guaranteed window coverage ahead of the cursor.
pub const CHECKBUF_SIZE: usize = 4096;

/// Sliding window buffer size.
pub const IN_BUF_SIZE: usize = 64 * 1024;

/// Progress callback cadence in input bytes.
const PROGRESS_STRIDE: u64 = 64 * 1024;

static NEXT_INPUT_ID: AtomicU64 = AtomicU64::new(1);

/// Fresh identifier for an input stream (detector state isolation).
pub fn next_input_id() -> u64 {
    NEXT_INPUT_ID.fetch_add(1, Ordering::Relaxed)
}

/// What a precompress pass found.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrecompressOutcome {
    pub anything_was_used: bool,
    pub non_zlib_was_used: bool,
}

impl PrecompressOutcome {
    #[must_use]
    pub fn found_anything(&self) -> bool {
        self.anything_was_used || self.non_zlib_was_used
    }
}

/// Fill `buf` from the stream until full or EOF; returns bytes read.
fn read_full(input: &mut dyn InputStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Run one precompress pass over `input`, writing records to `out`.
///
/// The container stream header is the caller's business (only depth 0 has
/// one); this function emits records and the terminator.
#[allow(clippy::too_many_arguments)]
pub fn precompress_stream(
    input: &mut dyn InputStream,
    out: &mut dyn OutputStream,
    switches: &Arc<Switches>,
    deflate_codec: &Arc<dyn DeflateCodec>,
    external: &Arc<ExternalCodecs>,
    stats: &mut Statistics,
    recursion: &mut RecursionState,
    progress_range: ProgressRange,
    progress_callback: Option<&dyn Fn(f32)>,
    input_id: u64,
) -> io::Result<PrecompressOutcome> {
    let fin_length = input.stream_len()?;
    let mut registry = build_scan_registry(switches, recursion.depth, external);
    let mut ignore = IgnoreSets::new();
    let mut outcome = PrecompressOutcome::default();

    // Progress is driven both by cursor strides and by output writes.
    let pos_cell = Rc::new(Cell::new(0u64));
    let mut observed = ObservableSink::new(out);
    if let Some(cb) = progress_callback {
        let cell = Rc::clone(&pos_cell);
        let range = progress_range;
        observed.register_write_observer(Box::new(move || {
            let frac = cell.get() as f32 / fin_length.max(1) as f32;
            cb(range.map(frac));
        }));
    }

    let mut in_buf = vec![0u8; IN_BUF_SIZE];
    let mut in_buf_pos: u64 = 0;
    let mut in_buf_len: usize = 0;
    input.seek_abs(0)?;

    let mut cursor: u64 = 0;
    let mut pending_literal: Option<(u64, u64)> = None; // (start, len)
    let mut next_progress = 0u64;

    while cursor < fin_length {
        pos_cell.set(cursor);
        if cursor >= next_progress {
            if let Some(cb) = progress_callback {
                cb(progress_range.map(cursor as f32 / fin_length.max(1) as f32));
            }
            next_progress = cursor + PROGRESS_STRIDE;
        }

        // Keep the window covering [cursor, cursor + CHECKBUF_SIZE).
        let window_end = in_buf_pos + in_buf_len as u64;
        let need_refill = cursor < in_buf_pos
            || cursor >= window_end
            || (window_end < fin_length && window_end < cursor + CHECKBUF_SIZE as u64);
        if need_refill {
            input.seek_abs(cursor)?;
            let want = (fin_length - cursor).min(IN_BUF_SIZE as u64) as usize;
            in_buf_len = read_full(input, &mut in_buf[..want])?;
            in_buf_pos = cursor;
        }
        let window = &in_buf[(cursor - in_buf_pos) as usize..in_buf_len];

        let mut claimed = None;
        if !switches.ignore_set.contains(&cursor) {
            for handler in registry.iter_mut() {
                let primary_tag = handler.tags()[0];
                if ignore.check_and_prune(primary_tag, cursor) {
                    continue;
                }
                if !handler.quick_check(window, input_id, cursor) {
                    continue;
                }
                let mut ctx = ScanCtx {
                    input: &mut *input,
                    input_id,
                    fin_length,
                    switches: switches.as_ref(),
                    stats: &mut *stats,
                    deflate_codec: deflate_codec.as_ref(),
                    external: external.as_ref(),
                    ignore: &mut ignore,
                };
                // A failing attempt is recovered locally: the byte stays
                // literal and scanning continues.
                match handler.attempt(&mut ctx, window, cursor) {
                    Ok(Some(record)) => {
                        claimed = Some(record);
                        break;
                    }
                    Ok(None) | Err(_) => {}
                }
            }
        }

        let Some(mut record) = claimed else {
            match &mut pending_literal {
                Some((_, len)) => *len += 1,
                None => pending_literal = Some((cursor, 1)),
            }
            cursor += 1;
            continue;
        };

        // Nested precompression of the expanded payload.
        if switches.max_recursion_depth > 0
            && record.recursion_capable()
            && record.payload.len() >= MIN_RECURSION_SIZE
        {
            let sub_range = progress_range.subrange(cursor, record.original_size, fin_length);
            if let Some(nested) = recursion_compress(
                &record.payload,
                switches,
                deflate_codec,
                external,
                stats,
                recursion,
                sub_range,
                next_input_id(),
            )? {
                record.recursion_length = Some(nested.stream.len());
                record.payload = nested.stream;
            }
        }

        debug_assert!(record.original_size > 0, "record must consume input");
        flush_literal(input, &mut observed, &mut pending_literal)?;
        write_record(&mut observed, &record)?;

        if record.tag == FormatTag::ZlibRaw {
            outcome.anything_was_used = true;
        } else {
            outcome.non_zlib_was_used = true;
        }
        cursor += record.original_size;
    }

    flush_literal(input, &mut observed, &mut pending_literal)?;
    // Terminator: zero-length literal run.
    observed.write_all(&[0])?;
    write_vli(&mut observed, 0)?;
    pos_cell.set(fin_length);
    if let Some(cb) = progress_callback {
        cb(progress_range.map(1.0));
    }
    Ok(outcome)
}

/// Emit a pending literal run as `0x00, vli(len), bytes`.
fn flush_literal(
    input: &mut dyn InputStream,
    out: &mut dyn Write,
    pending: &mut Option<(u64, u64)>,
) -> io::Result<()> {
    let Some((start, len)) = pending.take() else {
        return Ok(());
    };
    out.write_all(&[0])?;
    write_vli(out, len)?;
    input.seek_abs(start)?;
    fast_copy(input, out, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::ZlibTrialCodec;
    use crate::stream::MemStream;

    fn run_scan(data: Vec<u8>, switches: Switches) -> (Vec<u8>, PrecompressOutcome, Statistics) {
        let mut input = MemStream::from_vec(data);
        let mut out = MemStream::new();
        let switches = Arc::new(switches);
        let codec: Arc<dyn DeflateCodec> = Arc::new(ZlibTrialCodec);
        let external = Arc::new(ExternalCodecs::default());
        let mut stats = Statistics::default();
        let mut recursion = RecursionState::default();
        let outcome = precompress_stream(
            &mut input,
            &mut out,
            &switches,
            &codec,
            &external,
            &mut stats,
            &mut recursion,
            ProgressRange::FULL,
            None,
            next_input_id(),
        )
        .unwrap();
        (out.into_vec(), outcome, stats)
    }

    #[test]
    fn literal_only_input_produces_one_run() {
        let (pcf, outcome, _) = run_scan(b"Hello".to_vec(), Switches::default());
        assert_eq!(pcf, vec![0x00, 0x05, b'H', b'e', b'l', b'l', b'o', 0x00, 0x00]);
        assert!(!outcome.found_anything());
    }

    #[test]
    fn empty_input_is_just_a_terminator() {
        let (pcf, outcome, _) = run_scan(Vec::new(), Switches::default());
        assert_eq!(pcf, vec![0x00, 0x00]);
        assert!(!outcome.found_anything());
    }

    #[test]
    fn brute_false_positive_pattern_stays_literal() {
        let data: Vec<u8> = [0xEB, 0xE1, 0xF1]
            .iter()
            .copied()
            .cycle()
            .take(4096)
            .collect();
        let switches = Switches {
            brute_mode: true,
            ..Switches::default()
        };
        let (pcf, outcome, stats) = run_scan(data.clone(), switches);
        assert!(!outcome.found_anything());
        assert_eq!(stats.recompressed[FormatTag::Brute.as_usize()], 0);
        // One literal run carrying the whole input.
        assert_eq!(pcf[0], 0);
        let mut cur = std::io::Cursor::new(&pcf[1..]);
        let len = crate::vli::read_vli(&mut cur).unwrap();
        assert_eq!(len, 4096);
    }

    #[test]
    fn progress_reaches_range_maximum() {
        use std::cell::RefCell;
        let seen = RefCell::new(Vec::new());
        let cb = |p: f32| seen.borrow_mut().push(p);
        let mut input = MemStream::from_vec(vec![1u8; 1000]);
        let mut out = MemStream::new();
        let switches = Arc::new(Switches::default());
        let codec: Arc<dyn DeflateCodec> = Arc::new(ZlibTrialCodec);
        let external = Arc::new(ExternalCodecs::default());
        let mut stats = Statistics::default();
        let mut recursion = RecursionState::default();
        precompress_stream(
            &mut input,
            &mut out,
            &switches,
            &codec,
            &external,
            &mut stats,
            &mut recursion,
            ProgressRange {
                min_percent: 25.0,
                max_percent: 50.0,
            },
            Some(&cb),
            next_input_id(),
        )
        .unwrap();
        let seen = seen.into_inner();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&p| (25.0..=50.0).contains(&p)));
        assert!((seen.last().copied().unwrap() - 50.0).abs() < 1e-4);
    }
}
