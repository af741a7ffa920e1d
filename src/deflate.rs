//! Deflate precompress/reencode oracle and the penalty-byte contract.
//!
//! # Scope
//! - [`DeflateCodec`] is the seam between the scanner and whatever deflate
//!   reencoder backs it; the container and handlers treat the codec as an
//!   opaque oracle.
//! - [`ZlibTrialCodec`] is the in-tree implementation: streaming raw inflate
//!   for decode, and parameter trials (compression level sweep) plus the
//!   penalty mechanism for reencode selection.
//! - `try_recompression` orchestrates decode → selection → optional verify
//!   and yields the record-ready [`RecompressDeflateResult`].
//!
//! # Invariants
//! - An accepted result reproduces the original compressed span *exactly*:
//!   `reencode(spec, payload)` patched with `penalties` equals the original
//!   `compressed_size` bytes.
//! - Penalty offsets are strictly increasing within a record and the
//!   serialized list never exceeds `MAX_PENALTY_BYTES`.
//! - An empty expanded payload is never accepted.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::spill::{Payload, PayloadSink};
use crate::stream::{InputStream, COMP_CHUNK};

/// Serialized penalty list cap (5 bytes per entry on the wire).
pub const MAX_PENALTY_BYTES: usize = 16384;

/// Serialized size of one penalty entry: u32 offset + replacement byte.
pub const PENALTY_ENTRY_BYTES: usize = 5;

/// Inflate/deflate working buffer size.
const CODEC_BUF_SIZE: usize = 64 * 1024;

/// Minimum output for a short probe to count as a plausible stream when the
/// probe input ends inside the stream.
pub const PROBE_INPUT_BYTES: usize = 2048;

/// One reencode divergence: at `offset` the original carries `byte`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PenaltyByte {
    pub offset: u32,
    pub byte: u8,
}

/// How to regenerate the original deflate bytes from the expanded payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReencodeSpec {
    /// The stream is reproducible from compressor parameters alone.
    ZlibParams {
        comp_level: u8,
        mem_level: u8,
        window_bits: u8,
    },
    /// Opaque reconstruction blob interpreted by the codec.
    Recon(Vec<u8>),
}

impl ReencodeSpec {
    #[must_use]
    pub fn is_perfect(&self) -> bool {
        matches!(self, ReencodeSpec::ZlibParams { .. })
    }
}

/// Outcome of `DeflateCodec::decode`.
pub struct DeflateDecodeOutcome {
    /// Bytes of the original stream the decoder consumed.
    pub compressed_size: u64,
    /// The expanded payload.
    pub payload: Payload,
}

/// The deflate reencoder oracle contract.
///
/// Implementations must be deterministic: the same `(spec, payload)` pair
/// always produces the same bytes.
pub trait DeflateCodec: Send + Sync {
    /// Decode one raw deflate stream starting at the input's current
    /// position. Returns `None` when no valid stream starts there.
    fn decode(
        &self,
        input: &mut dyn InputStream,
        meta_block_size: usize,
    ) -> io::Result<Option<DeflateDecodeOutcome>>;

    /// Choose a reencode spec that reproduces the original span (read from
    /// `input` at `stream_pos`) from `payload`, within the penalty budget.
    fn select_reencode(
        &self,
        input: &mut dyn InputStream,
        stream_pos: u64,
        compressed_size: u64,
        payload: &Payload,
        window_bits_hint: u8,
    ) -> io::Result<Option<(ReencodeSpec, Vec<PenaltyByte>)>>;

    /// Regenerate the deflate bytes into `out`. Returns false when the spec
    /// cannot be honored (corrupt recon data).
    fn reencode(
        &self,
        spec: &ReencodeSpec,
        payload: &mut dyn Read,
        uncompressed_size: u64,
        out: &mut dyn Write,
    ) -> io::Result<bool>;
}

/// Record-ready result of a precompression attempt.
pub struct RecompressDeflateResult {
    pub accepted: bool,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub payload: Option<Payload>,
    pub spec: ReencodeSpec,
    pub penalties: Vec<PenaltyByte>,
}

impl RecompressDeflateResult {
    fn rejected(compressed_size: u64, uncompressed_size: u64) -> Self {
        Self {
            accepted: false,
            compressed_size,
            uncompressed_size,
            payload: None,
            spec: ReencodeSpec::ZlibParams {
                comp_level: 0,
                mem_level: 0,
                window_bits: 0,
            },
            penalties: Vec::new(),
        }
    }
}

/// Decode + reencode selection + optional verification, in one call.
///
/// `input` may be left at an arbitrary position; callers re-seek afterwards.
pub fn try_recompression(
    codec: &dyn DeflateCodec,
    input: &mut dyn InputStream,
    stream_pos: u64,
    window_bits_hint: u8,
    meta_block_size: usize,
    verify: bool,
) -> io::Result<RecompressDeflateResult> {
    input.seek_abs(stream_pos)?;
    let Some(outcome) = codec.decode(input, meta_block_size)? else {
        return Ok(RecompressDeflateResult::rejected(0, 0));
    };
    let uncompressed_size = outcome.payload.len();
    if uncompressed_size == 0 {
        return Ok(RecompressDeflateResult::rejected(outcome.compressed_size, 0));
    }

    let Some((spec, penalties)) = codec.select_reencode(
        input,
        stream_pos,
        outcome.compressed_size,
        &outcome.payload,
        window_bits_hint,
    )?
    else {
        return Ok(RecompressDeflateResult::rejected(
            outcome.compressed_size,
            uncompressed_size,
        ));
    };

    if verify
        && !verify_reconstruction(
            codec,
            input,
            stream_pos,
            outcome.compressed_size,
            &outcome.payload,
            &spec,
            &penalties,
        )?
    {
        return Ok(RecompressDeflateResult::rejected(
            outcome.compressed_size,
            uncompressed_size,
        ));
    }

    Ok(RecompressDeflateResult {
        accepted: true,
        compressed_size: outcome.compressed_size,
        uncompressed_size,
        payload: Some(outcome.payload),
        spec,
        penalties,
    })
}

/// Regenerate the original span: reencode, then apply penalty patches.
///
/// With an empty penalty list the reencode streams straight into `out`;
/// otherwise it is staged in a spill-capable sink for patching.
pub fn reconstruct_deflate(
    codec: &dyn DeflateCodec,
    spec: &ReencodeSpec,
    payload: &mut dyn Read,
    uncompressed_size: u64,
    penalties: &[PenaltyByte],
    out: &mut dyn Write,
) -> io::Result<bool> {
    if penalties.is_empty() {
        return codec.reencode(spec, payload, uncompressed_size, out);
    }

    let mut staged = PayloadSink::new();
    if !codec.reencode(spec, payload, uncompressed_size, &mut staged)? {
        return Ok(false);
    }
    let patched = staged.into_payload()?;
    match patched {
        Payload::InMemory(mut bytes) => {
            for p in penalties {
                let off = p.offset as usize;
                if off >= bytes.len() {
                    return Ok(false);
                }
                bytes[off] = p.byte;
            }
            out.write_all(&bytes)?;
        }
        Payload::Spilled { file, len } => {
            let mut f = file.reopen()?;
            for p in penalties {
                if u64::from(p.offset) >= len {
                    return Ok(false);
                }
                f.seek(SeekFrom::Start(u64::from(p.offset)))?;
                f.write_all(&[p.byte])?;
            }
            f.seek(SeekFrom::Start(0))?;
            crate::stream::fast_copy(&mut f, out, len)?;
        }
    }
    Ok(true)
}

static VERIFY_DUMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Full round-trip check of an accepted result against the original bytes.
///
/// On mismatch the original span is dumped to a uniquely numbered
/// `reencode_error_NNNN.raw` in the working directory for diagnostics.
fn verify_reconstruction(
    codec: &dyn DeflateCodec,
    input: &mut dyn InputStream,
    stream_pos: u64,
    compressed_size: u64,
    payload: &Payload,
    spec: &ReencodeSpec,
    penalties: &[PenaltyByte],
) -> io::Result<bool> {
    let mut staged = PayloadSink::new();
    let mut reader = payload.reader()?;
    if !reconstruct_deflate(codec, spec, &mut reader, payload.len(), penalties, &mut staged)? {
        return Ok(false);
    }
    let reencoded = staged.into_payload()?;
    if reencoded.len() != compressed_size {
        dump_verify_failure(input, stream_pos, compressed_size)?;
        return Ok(false);
    }

    input.seek_abs(stream_pos)?;
    let mut re = reencoded.reader()?;
    let mut a = [0u8; COMP_CHUNK];
    let mut b = [0u8; COMP_CHUNK];
    let mut remaining = compressed_size;
    while remaining > 0 {
        let want = (a.len() as u64).min(remaining) as usize;
        input.read_exact(&mut a[..want])?;
        re.read_exact(&mut b[..want])?;
        if a[..want] != b[..want] {
            dump_verify_failure(input, stream_pos, compressed_size)?;
            return Ok(false);
        }
        remaining -= want as u64;
    }
    Ok(true)
}

fn dump_verify_failure(
    input: &mut dyn InputStream,
    stream_pos: u64,
    compressed_size: u64,
) -> io::Result<()> {
    let n = VERIFY_DUMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("reencode_error_{n:04}.raw");
    let mut f = std::fs::File::create(name)?;
    input.seek_abs(stream_pos)?;
    crate::stream::fast_copy(input, &mut f, compressed_size)?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Default codec: streaming inflate + compression-level trials
// ----------------------------------------------------------------------------

/// flate2-backed oracle.
///
/// Decode drives a raw `Decompress` manually with `total_in`/`total_out`
/// accounting. Reencode selection sweeps compression levels 1..=9 (the
/// backend fixes `mem_level = 8`, `window_bits = 15` for compression) and
/// accepts the first level that reproduces the span within the penalty
/// budget. Streams no trial can reproduce are rejected and degrade to
/// literals at the call site.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZlibTrialCodec;

/// Trial order: common defaults first so most streams exit early.
const TRIAL_LEVELS: [u8; 9] = [6, 9, 8, 7, 5, 4, 3, 2, 1];

impl DeflateCodec for ZlibTrialCodec {
    fn decode(
        &self,
        input: &mut dyn InputStream,
        meta_block_size: usize,
    ) -> io::Result<Option<DeflateDecodeOutcome>> {
        let mut sink = PayloadSink::new();
        let mut de = Decompress::new(false);
        let mut in_buf = vec![0u8; CODEC_BUF_SIZE.min(meta_block_size.max(1))];
        let mut out_buf = vec![0u8; CODEC_BUF_SIZE];
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
            let status = match de.decompress(
                &in_buf[in_pos..in_len],
                &mut out_buf,
                FlushDecompress::None,
            ) {
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
                    return Ok(Some(DeflateDecodeOutcome {
                        compressed_size: de.total_in(),
                        payload: sink.into_payload()?,
                    }));
                }
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        if in_pos == in_len && !input_done {
                            continue; // refill and retry
                        }
                        // Truncated or stalled stream.
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn select_reencode(
        &self,
        input: &mut dyn InputStream,
        stream_pos: u64,
        compressed_size: u64,
        payload: &Payload,
        window_bits_hint: u8,
    ) -> io::Result<Option<(ReencodeSpec, Vec<PenaltyByte>)>> {
        for &level in &TRIAL_LEVELS {
            match trial_compare(input, stream_pos, compressed_size, payload, level)? {
                TrialOutcome::Match(penalties) => {
                    // First match wins: trial order already prefers likely
                    // levels and every further trial costs a full deflate
                    // pass over the payload.
                    let spec = ReencodeSpec::ZlibParams {
                        comp_level: level,
                        mem_level: 8,
                        window_bits: window_bits_hint,
                    };
                    return Ok(Some((spec, penalties)));
                }
                TrialOutcome::NoMatch => {}
            }
        }
        Ok(None)
    }

    fn reencode(
        &self,
        spec: &ReencodeSpec,
        payload: &mut dyn Read,
        uncompressed_size: u64,
        out: &mut dyn Write,
    ) -> io::Result<bool> {
        let ReencodeSpec::ZlibParams { comp_level, .. } = spec else {
            // This codec never emits recon blobs and cannot interpret them.
            return Ok(false);
        };
        if *comp_level == 0 || *comp_level > 9 {
            return Ok(false);
        }
        drive_deflate(*comp_level, payload, uncompressed_size, &mut |chunk| {
            out.write_all(chunk)
        })?;
        Ok(true)
    }
}

enum TrialOutcome {
    Match(Vec<PenaltyByte>),
    NoMatch,
}

/// Streaming penalty comparator shared by every reencode-and-compare path.
///
/// Divergences cost `PENALTY_ENTRY_BYTES` each; matches pay the debt back a
/// byte at a time. The comparison fails once the remaining span cannot
/// amortize the debt, the serialized list would exceed `MAX_PENALTY_BYTES`,
/// or the produced stream over- or under-runs the original span.
pub struct PenaltyAccumulator {
    total: u64,
    compared: u64,
    credit: i64,
    penalties: Vec<PenaltyByte>,
    failed: bool,
}

impl PenaltyAccumulator {
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            total,
            compared: 0,
            credit: 0,
            penalties: Vec::new(),
            failed: false,
        }
    }

    /// Compare one produced byte against the original. Returns false once
    /// the comparison has failed (callers may stop producing).
    pub fn push_byte(&mut self, original: u8, produced: u8) -> bool {
        if self.failed {
            return false;
        }
        if self.compared >= self.total {
            self.failed = true;
            return false;
        }
        if original != produced {
            self.credit -= PENALTY_ENTRY_BYTES as i64;
            if self.credit + (self.total - self.compared) as i64 - 1 < 0
                || (self.penalties.len() + 1) * PENALTY_ENTRY_BYTES >= MAX_PENALTY_BYTES
                || self.compared > u64::from(u32::MAX)
            {
                self.failed = true;
                return false;
            }
            self.penalties.push(PenaltyByte {
                offset: self.compared as u32,
                byte: original,
            });
        } else {
            self.credit += 1;
        }
        self.compared += 1;
        true
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Bytes compared so far.
    #[must_use]
    pub fn compared(&self) -> u64 {
        self.compared
    }

    /// Succeeds only when the produced stream covered the span exactly.
    #[must_use]
    pub fn into_penalties(self) -> Option<Vec<PenaltyByte>> {
        if self.failed || self.compared != self.total {
            return None;
        }
        Some(self.penalties)
    }
}

/// Deflate `payload` at `level` and compare the output against the original
/// span, accumulating penalty bytes.
///
/// Abort rules follow the penalty contract: a divergence costs
/// `PENALTY_ENTRY_BYTES`, matches earn the cost back one byte at a time, and
/// a trial dies when the remaining span can no longer amortize the debt or
/// the serialized list would exceed `MAX_PENALTY_BYTES`.
fn trial_compare(
    input: &mut dyn InputStream,
    stream_pos: u64,
    compressed_size: u64,
    payload: &Payload,
    level: u8,
) -> io::Result<TrialOutcome> {
    input.seek_abs(stream_pos)?;

    let mut acc = PenaltyAccumulator::new(compressed_size);
    let mut orig_buf = vec![0u8; CODEC_BUF_SIZE];
    let mut orig_len = 0usize;
    let mut orig_pos = 0usize;

    let mut payload_reader = payload.reader()?;
    let produced = drive_deflate(level, &mut payload_reader, payload.len(), &mut |chunk| {
        for &re_byte in chunk {
            if acc.is_failed() {
                return Ok(());
            }
            if orig_pos == orig_len {
                let done = acc.compared;
                let remaining =
                    (compressed_size.saturating_sub(done)).min(orig_buf.len() as u64) as usize;
                if remaining == 0 {
                    // Trial output is longer than the original stream.
                    acc.failed = true;
                    return Ok(());
                }
                input.read_exact(&mut orig_buf[..remaining])?;
                orig_len = remaining;
                orig_pos = 0;
            }
            let orig_byte = orig_buf[orig_pos];
            orig_pos += 1;
            acc.push_byte(orig_byte, re_byte);
        }
        Ok(())
    })?;

    if produced != compressed_size {
        return Ok(TrialOutcome::NoMatch);
    }
    match acc.into_penalties() {
        Some(penalties) => Ok(TrialOutcome::Match(penalties)),
        None => Ok(TrialOutcome::NoMatch),
    }
}

/// Drive a raw deflate compression of exactly `len` payload bytes, handing
/// output chunks to `on_chunk`. Returns total bytes produced.
fn drive_deflate(
    level: u8,
    payload: &mut dyn Read,
    len: u64,
    on_chunk: &mut dyn FnMut(&[u8]) -> io::Result<()>,
) -> io::Result<u64> {
    let mut co = Compress::new(Compression::new(u32::from(level)), false);
    let mut in_buf = vec![0u8; CODEC_BUF_SIZE];
    let mut out_buf = vec![0u8; CODEC_BUF_SIZE];
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
        let flush = if remaining == 0 && in_pos == in_len {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };

        let before_in = co.total_in();
        let before_out = co.total_out();
        let status = co
            .compress(&in_buf[in_pos..in_len], &mut out_buf, flush)
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

/// Short inflate probe used by the brute quick check.
///
/// Feeds up to `PROBE_INPUT_BYTES` from `window` through a raw inflater.
/// Plausible iff the stream is still going when the probe input runs out, or
/// it ends cleanly having produced at least `min_stream_out` bytes (short
/// complete streams are overwhelmingly false positives).
pub fn inflate_probe(window: &[u8], min_stream_out: usize) -> bool {
    let mut de = Decompress::new(false);
    let mut out_buf = [0u8; 16 * 1024];
    let probe = &window[..window.len().min(PROBE_INPUT_BYTES)];
    let mut in_pos = 0usize;
    let mut have = 0usize;

    loop {
        let before_in = de.total_in();
        let before_out = de.total_out();
        let status = match de.decompress(&probe[in_pos..], &mut out_buf, FlushDecompress::None) {
            Ok(status) => status,
            Err(_) => return false,
        };
        let consumed = (de.total_in() - before_in) as usize;
        let produced = (de.total_out() - before_out) as usize;
        in_pos += consumed;
        have += produced;

        match status {
            Status::StreamEnd => return have >= min_stream_out,
            Status::Ok | Status::BufError => {
                if in_pos >= probe.len() {
                    // Ran off the probe window with the stream still open:
                    // long stream, worth a full attempt.
                    return true;
                }
                if consumed == 0 && produced == 0 {
                    return false;
                }
            }
        }
    }
}
