//! Lossless precompressor with a reversible container format.
//!
//! The library reads an arbitrary byte stream and produces an equivalent
//! stream in which previously-compressed substreams (deflate-family: raw
//! zlib, gzip, ZIP local files, PDF `/FlateDecode`, PNG IDAT, SWF, plus
//! GIF/LZW, bzip2 and base64-wrapped containers) are replaced by their
//! expanded payload plus a small reconstruction record. The expanded stream
//! compresses far better under a general-purpose compressor; the inverse
//! pass rebuilds the original bit-exactly.
//!
//! High-level flow (precompress):
//! 1) The scanner sweeps the input byte by byte over a sliding window.
//! 2) Format handlers are probed in fixed order; the first full success
//!    claims the span and emits a record, everything else coalesces into
//!    literal runs.
//! 3) Deflate-family handlers delegate to the reencoder oracle; acceptance
//!    requires reproducing the original span exactly (penalty bytes absorb
//!    small divergence).
//! 4) Large expanded payloads are recursively precompressed, bounded by the
//!    configured depth.
//!
//! Recompress is the mirror image, with recursive payloads expanded through
//! a worker-thread passthrough pipe.
//!
//! Worst case the output degenerates to a one-to-one literal copy; the
//! inverse pass is bit-exact or fails loudly, never silently wrong.

pub mod config;
pub mod container;
pub mod deflate;
pub mod error;
pub mod formats;
pub mod histogram;
pub mod recompress;
pub mod recursion;
pub mod scan;
pub mod spill;
pub mod stats;
pub mod stream;
pub mod vli;

use std::io::Write;
use std::sync::Arc;

use crate::config::Switches;
use crate::deflate::{DeflateCodec, ZlibTrialCodec};
use crate::error::{PrecompError, Result, ReturnCode};
use crate::formats::{ExternalCodecs, JpegCodec, Mp3Codec, RecompressTools};
use crate::recursion::RecursionState;
use crate::stats::{ProgressRange, Statistics};
use crate::stream::{InputStream, MemStream, OutputStream};

pub use crate::formats::FormatTag;

/// Logging verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Normal = 0,
    Debug = 1,
}

/// Injected logging sink; replaces process-global state.
pub struct Logger {
    level: LogLevel,
    callback: Option<Box<dyn Fn(LogLevel, &str)>>,
}

impl Logger {
    pub fn new(level: LogLevel, callback: Option<Box<dyn Fn(LogLevel, &str)>>) -> Self {
        Self { level, callback }
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        if level > self.level {
            return;
        }
        if let Some(cb) = &self.callback {
            cb(level, msg);
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            level: LogLevel::Normal,
            callback: None,
        }
    }
}

/// Top-level object: configure once, attach streams, run.
///
/// Lifecycle: [`Precomp::new`] → mutate [`Precomp::switches_mut`] → attach
/// input/output → [`Precomp::precompress`] or [`Precomp::read_header`] +
/// [`Precomp::recompress`]. The configuration is treated as frozen once a
/// run starts.
pub struct Precomp {
    switches: Switches,
    deflate_codec: Arc<dyn DeflateCodec>,
    external: ExternalCodecs,

    input: Option<Box<dyn InputStream>>,
    input_file_name: String,
    output: Option<MemStream>,
    output_file: Option<std::fs::File>,
    output_file_name: String,

    stats: Statistics,
    recursion: RecursionState,
    header_already_read: bool,

    progress_callback: Option<Box<dyn Fn(f32)>>,
    logger: Logger,
}

impl Precomp {
    pub fn new() -> Self {
        Self {
            switches: Switches::default(),
            deflate_codec: Arc::new(ZlibTrialCodec),
            external: ExternalCodecs::default(),
            input: None,
            input_file_name: String::new(),
            output: None,
            output_file: None,
            output_file_name: String::new(),
            stats: Statistics::default(),
            recursion: RecursionState::default(),
            header_already_read: false,
            progress_callback: None,
            logger: Logger::default(),
        }
    }

    pub fn switches(&self) -> &Switches {
        &self.switches
    }

    /// Mutable configuration access; call before starting a run.
    pub fn switches_mut(&mut self) -> &mut Switches {
        &mut self.switches
    }

    /// Swap the deflate reencoder oracle.
    pub fn set_deflate_codec(&mut self, codec: Arc<dyn DeflateCodec>) {
        self.deflate_codec = codec;
    }

    pub fn set_jpeg_codec(&mut self, codec: Arc<dyn JpegCodec>) {
        self.external.jpeg = Some(codec);
    }

    pub fn set_mp3_codec(&mut self, codec: Arc<dyn Mp3Codec>) {
        self.external.mp3 = Some(codec);
    }

    pub fn set_input_stream(&mut self, stream: Box<dyn InputStream>, file_name: &str) {
        self.input = Some(stream);
        self.input_file_name = file_name.to_string();
    }

    pub fn set_input_file(&mut self, file: std::fs::File, file_name: &str) {
        self.set_input_stream(Box::new(file), file_name);
    }

    pub fn set_input_bytes(&mut self, bytes: Vec<u8>, file_name: &str) {
        self.set_input_stream(Box::new(MemStream::from_vec(bytes)), file_name);
    }

    /// Attach a file output.
    pub fn set_output_file(&mut self, file: std::fs::File) {
        self.output_file = Some(file);
        self.output = None;
    }

    /// Attach an in-memory output; retrieve it with [`Precomp::take_output`].
    pub fn set_output_bytes(&mut self) {
        self.output = Some(MemStream::new());
        self.output_file = None;
    }

    /// Detach the in-memory output after a run.
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.output.take().map(MemStream::into_vec)
    }

    pub fn set_progress_callback(&mut self, callback: Box<dyn Fn(f32)>) {
        self.progress_callback = Some(callback);
    }

    pub fn set_logger(&mut self, logger: Logger) {
        self.logger = logger;
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn recursion_state(&self) -> RecursionState {
        self.recursion
    }

    /// The filename recovered from the container header, once read.
    pub fn output_file_name(&self) -> &str {
        &self.output_file_name
    }

    /// Precompress the attached input into the attached output.
    pub fn precompress(&mut self) -> ReturnCode {
        match self.precompress_inner() {
            Ok(true) => ReturnCode::Success,
            Ok(false) => ReturnCode::NothingDecompressed,
            Err(err) => {
                self.logger
                    .log(LogLevel::Normal, &format!("precompression failed: {err}"));
                err.return_code()
            }
        }
    }

    fn precompress_inner(&mut self) -> Result<bool> {
        self.switches
            .validate()
            .map_err(|err| PrecompError::Generic(err.to_string()))?;
        let mut input = self
            .input
            .take()
            .ok_or_else(|| PrecompError::Generic("no input stream attached".into()))?;

        let switches = Arc::new(self.switches.clone());
        let external = Arc::new(self.external.clone());

        let run = {
            let output: &mut dyn OutputStream = match (&mut self.output, &mut self.output_file)
            {
                (Some(mem), _) => mem,
                (None, Some(file)) => file,
                (None, None) => {
                    self.input = Some(input);
                    return Err(PrecompError::Generic("no output stream attached".into()));
                }
            };
            let callback = self.progress_callback.as_deref();
            (|| -> Result<bool> {
                container::write_stream_header(output, &self.input_file_name)?;
                let outcome = scan::precompress_stream(
                    &mut *input,
                    output,
                    &switches,
                    &self.deflate_codec,
                    &external,
                    &mut self.stats,
                    &mut self.recursion,
                    ProgressRange::FULL,
                    callback,
                    scan::next_input_id(),
                )?;
                output.flush().map_err(PrecompError::Io)?;
                Ok(outcome.found_anything())
            })()
        };

        self.input = Some(input);
        let found = run?;
        self.logger.log(
            LogLevel::Debug,
            &format!(
                "precompression done: {} detected, {} recompressed",
                self.stats.decompressed_streams_total, self.stats.recompressed_streams_total
            ),
        );
        Ok(found)
    }

    /// Parse and validate the container header of the attached input.
    pub fn read_header(&mut self) -> ReturnCode {
        match self.read_header_inner() {
            Ok(()) => ReturnCode::Success,
            Err(err) => err.return_code(),
        }
    }

    fn read_header_inner(&mut self) -> Result<()> {
        if self.header_already_read {
            return Err(PrecompError::Generic(
                "attempted to read the stream header twice".into(),
            ));
        }
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| PrecompError::Generic("no input stream attached".into()))?;
        let name = container::read_stream_header(&mut **input)?;
        if self.output_file_name.is_empty() {
            self.output_file_name = name;
        }
        self.header_already_read = true;
        Ok(())
    }

    /// Regenerate the original stream from the attached container input.
    pub fn recompress(&mut self) -> ReturnCode {
        match self.recompress_inner() {
            Ok(()) => ReturnCode::Success,
            Err(err) => {
                self.logger
                    .log(LogLevel::Normal, &format!("recompression failed: {err}"));
                err.return_code()
            }
        }
    }

    fn recompress_inner(&mut self) -> Result<()> {
        if !self.header_already_read {
            self.read_header_inner()?;
        }
        let mut input = self
            .input
            .take()
            .ok_or_else(|| PrecompError::Generic("no input stream attached".into()))?;

        let tools = RecompressTools {
            switches: Arc::new(self.switches.clone()),
            deflate_codec: Arc::clone(&self.deflate_codec),
            external: Arc::new(self.external.clone()),
            recursion_depth: 0,
        };

        let run = {
            let output: &mut dyn Write = match (&mut self.output, &mut self.output_file) {
                (Some(mem), _) => mem,
                (None, Some(file)) => file,
                (None, None) => {
                    self.input = Some(input);
                    return Err(PrecompError::Generic("no output stream attached".into()));
                }
            };
            let run = recompress::recompress_records(&mut *input, output, &tools);
            run.and_then(|()| output.flush().map_err(PrecompError::Io))
        };

        self.input = Some(input);
        run
    }
}

impl Default for Precomp {
    fn default() -> Self {
        Self::new()
    }
}
