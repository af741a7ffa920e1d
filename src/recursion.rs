//! Bounded nested precompression and the recompress-side passthrough pipe.
//!
//! # Scope
//! - `recursion_compress`: materialized nested precompression of an expanded
//!   payload during scanning (depth-bounded, non-fatal on limit).
//! - `recursion_decompress`: pipelined inverse scanning during
//!   recompression. A worker thread runs the record reader over the nested
//!   container stream; the caller consumes the expanded bytes through a
//!   blocking single-producer/single-consumer pipe.
//!
//! # Concurrency
//! One lock guards `(buffer, read cursor, accumulated, write_eof, read_eof,
//! worker return code)`; two condvars signal `data_available` and
//! `data_needed`. The writer blocks while the buffer holds unread bytes and
//! replaces it wholesale (up to `CHUNK` bytes) when the reader drains it.
//! Cancellation forces both EOF flags, broadcasts both condvars, and joins
//! the worker; a producer that wakes up cancelled fails its write so the
//! worker unwinds.

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::config::Switches;
use crate::error::{PrecompError, Result, ReturnCode};
use crate::formats::{ExternalCodecs, RecompressTools};
use crate::spill::{Payload, PayloadSink};
use crate::stats::{ProgressRange, Statistics};
use crate::stream::{InputStream, OutputStream, CHUNK};

/// Payloads below this size cannot plausibly amortize a nested stream.
pub const MIN_RECURSION_SIZE: u64 = 4 * crate::scan::CHECKBUF_SIZE as u64;

/// Mutable recursion bookkeeping threaded through a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecursionState {
    pub depth: u32,
    pub max_depth_used: u32,
    /// Sticky: set once any attempt hits the depth bound.
    pub max_depth_reached: bool,
}

/// Outcome of a nested precompression attempt.
pub struct RecursionResult {
    /// The nested container stream replacing the payload.
    pub stream: Payload,
}

/// Run the scanner over `payload`, producing a nested container stream.
///
/// Returns `None` when the depth budget is exhausted (sticky flag set) or
/// the nested pass finds nothing to expand.
#[allow(clippy::too_many_arguments)]
pub fn recursion_compress(
    payload: &Payload,
    switches: &Arc<Switches>,
    deflate_codec: &Arc<dyn crate::deflate::DeflateCodec>,
    external: &Arc<ExternalCodecs>,
    stats: &mut Statistics,
    recursion: &mut RecursionState,
    progress: ProgressRange,
    input_id: u64,
) -> io::Result<Option<RecursionResult>> {
    if recursion.depth + 1 > switches.max_recursion_depth {
        recursion.max_depth_reached = true;
        return Ok(None);
    }

    let mut reader = payload.reader()?;
    let mut sink = PayloadSink::new();

    recursion.depth += 1;
    let outcome = crate::scan::precompress_stream(
        &mut reader,
        &mut sink,
        switches,
        deflate_codec,
        external,
        stats,
        recursion,
        progress,
        None,
        input_id,
    );
    recursion.depth -= 1;
    let outcome = outcome?;

    if !(outcome.anything_was_used || outcome.non_zlib_was_used) {
        return Ok(None);
    }
    recursion.max_depth_used = recursion.max_depth_used.max(recursion.depth + 1);
    Ok(Some(RecursionResult {
        stream: sink.into_payload()?,
    }))
}

// ----------------------------------------------------------------------------
// Passthrough pipe
// ----------------------------------------------------------------------------

struct PassState {
    buffer: Vec<u8>,
    read_pos: usize,
    /// Bytes fully consumed out of retired buffers.
    accumulated: u64,
    write_eof: bool,
    read_eof: bool,
    worker_code: ReturnCode,
}

struct PassShared {
    state: Mutex<PassState>,
    data_available: Condvar,
    data_needed: Condvar,
}

impl PassShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(PassState {
                buffer: Vec::with_capacity(CHUNK),
                read_pos: 0,
                accumulated: 0,
                write_eof: false,
                read_eof: false,
                worker_code: ReturnCode::Success,
            }),
            data_available: Condvar::new(),
            data_needed: Condvar::new(),
        }
    }

    /// Force both EOF flags and wake everyone; any blocked side returns.
    fn unlock_everything(&self) {
        let mut st = self.state.lock().expect("passthrough lock poisoned");
        st.write_eof = true;
        st.read_eof = true;
        self.data_available.notify_all();
        self.data_needed.notify_all();
    }
}

/// Producer half, held by the worker thread.
pub struct PassWriter {
    shared: Arc<PassShared>,
}

impl Write for PassWriter {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let mut written = 0usize;
        let mut st = self.shared.state.lock().expect("passthrough lock poisoned");
        while written < src.len() {
            if st.write_eof || st.read_eof {
                // Forced cancel: fail so the worker unwinds.
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "passthrough cancelled",
                ));
            }
            if st.read_pos < st.buffer.len() {
                // Unread data pending; wait for the consumer to drain it.
                self.shared.data_available.notify_one();
                st = self
                    .shared
                    .data_needed
                    .wait(st)
                    .expect("passthrough lock poisoned");
                continue;
            }

            // Buffer fully consumed: retire it and install the next chunk.
            st.accumulated += st.buffer.len() as u64;
            st.read_pos = 0;
            let take = (src.len() - written).min(CHUNK);
            st.buffer.clear();
            st.buffer.extend_from_slice(&src[written..written + take]);
            written += take;
            self.shared.data_available.notify_one();
        }
        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Like seeking, flushing has no meaning on the pipe.
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "cannot flush a passthrough stream",
        ))
    }
}

impl OutputStream for PassWriter {
    fn tell_out(&mut self) -> io::Result<u64> {
        let st = self.shared.state.lock().expect("passthrough lock poisoned");
        Ok(st.accumulated + st.buffer.len() as u64)
    }
}

/// Consumer half plus worker lifecycle; dropping cancels and joins.
pub struct PassthroughReader {
    shared: Arc<PassShared>,
    worker: Option<JoinHandle<ReturnCode>>,
}

impl PassthroughReader {
    /// Join the worker and surface its return code.
    pub fn finish(&mut self) -> Result<()> {
        self.shared.unlock_everything();
        let code = match self.worker.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(ReturnCode::GenericOrUnknown),
            None => {
                self.shared
                    .state
                    .lock()
                    .expect("passthrough lock poisoned")
                    .worker_code
            }
        };
        if code != ReturnCode::Success {
            return Err(PrecompError::CancelledRecursion(code));
        }
        Ok(())
    }

    /// Read-side position: consumed bytes plus the cursor in-buffer.
    pub fn tell_in(&self) -> u64 {
        let st = self.shared.state.lock().expect("passthrough lock poisoned");
        st.accumulated + st.read_pos as u64
    }
}

impl Read for PassthroughReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let mut st = self.shared.state.lock().expect("passthrough lock poisoned");
        loop {
            let available = st.buffer.len() - st.read_pos;
            if available > 0 {
                let n = available.min(dst.len());
                dst[..n].copy_from_slice(&st.buffer[st.read_pos..st.read_pos + n]);
                st.read_pos += n;
                if st.read_pos == st.buffer.len() {
                    self.shared.data_needed.notify_one();
                }
                return Ok(n);
            }
            if st.write_eof {
                st.read_eof = true;
                return Ok(0);
            }
            self.shared.data_needed.notify_one();
            st = self
                .shared
                .data_available
                .wait(st)
                .expect("passthrough lock poisoned");
        }
    }
}

impl Drop for PassthroughReader {
    fn drop(&mut self) {
        self.shared.unlock_everything();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the inverse scanner over the next `recursion_length` bytes of
/// `input`, returning the reader end of the pipe.
///
/// The nested stream region is materialized (memory or spill) so the worker
/// owns its input; the expanded output streams through the pipe without ever
/// being materialized.
pub fn recursion_decompress(
    input: &mut dyn InputStream,
    recursion_length: u64,
    tools: &RecompressTools,
) -> Result<PassthroughReader> {
    // Recompression honors whatever nesting the stream carries; the hard cap
    // only guards against maliciously self-nested containers.
    const MAX_RECOMPRESS_DEPTH: u32 = 64;
    if tools.recursion_depth >= MAX_RECOMPRESS_DEPTH {
        return Err(PrecompError::RecompressionFailure);
    }

    // Materialize the nested region.
    let mut sink = PayloadSink::new();
    crate::stream::fast_copy(input, &mut sink, recursion_length).map_err(PrecompError::Io)?;
    let region = sink.into_payload().map_err(PrecompError::Io)?;

    let shared = Arc::new(PassShared::new());
    let writer_shared = Arc::clone(&shared);
    let nested_tools = tools.nested();

    let worker = std::thread::Builder::new()
        .name("precomp-recursion".into())
        .spawn(move || {
            let mut writer = PassWriter {
                shared: Arc::clone(&writer_shared),
            };
            let mut reader = match region.reader() {
                Ok(reader) => reader,
                Err(_) => {
                    let code = ReturnCode::GenericOrUnknown;
                    set_worker_code(&writer_shared, code);
                    return code;
                }
            };
            let code = match crate::recompress::recompress_records(
                &mut reader,
                &mut writer,
                &nested_tools,
            ) {
                Ok(()) => ReturnCode::Success,
                Err(err) => err.return_code(),
            };
            set_worker_code(&writer_shared, code);
            code
        })
        .map_err(PrecompError::Io)?;

    Ok(PassthroughReader {
        shared,
        worker: Some(worker),
    })
}

fn set_worker_code(shared: &Arc<PassShared>, code: ReturnCode) {
    {
        let mut st = shared.state.lock().expect("passthrough lock poisoned");
        st.worker_code = code;
    }
    shared.unlock_everything();
}
