//! Payload buffering with spill-to-disk.
//!
//! # Scope
//! Expanded payloads start in memory and move to a temporary file once they
//! cross `MAX_IO_BUFFER_SIZE`. The produced [`Payload`] is either the
//! in-memory vector or the spill handle; the temp file is deleted when the
//! payload is dropped.
//!
//! # Invariants
//! - `len()` equals the total bytes written regardless of backing.
//! - A spilled payload's file contains exactly the written bytes, in order.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use tempfile::NamedTempFile;

use crate::stream::{InputStream, OutputStream};

/// In-memory buffering cap before spilling to a temp file.
pub const MAX_IO_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Sink that buffers in memory and spills once past a threshold.
pub struct PayloadSink {
    threshold: usize,
    written: u64,
    mem: Vec<u8>,
    spill: Option<NamedTempFile>,
}

impl PayloadSink {
    pub fn new() -> Self {
        Self::with_threshold(MAX_IO_BUFFER_SIZE)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            written: 0,
            mem: Vec::new(),
            spill: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.written
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Finish writing and produce the payload.
    pub fn into_payload(mut self) -> io::Result<Payload> {
        match self.spill.take() {
            Some(mut f) => {
                f.flush()?;
                Ok(Payload::Spilled {
                    len: self.written,
                    file: f,
                })
            }
            None => Ok(Payload::InMemory(self.mem)),
        }
    }
}

impl Default for PayloadSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for PayloadSink {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if self.spill.is_none() && self.mem.len() + src.len() > self.threshold {
            let mut f = NamedTempFile::new()?;
            f.write_all(&self.mem)?;
            self.mem = Vec::new();
            self.spill = Some(f);
        }
        match &mut self.spill {
            Some(f) => f.write_all(src)?,
            None => self.mem.extend_from_slice(src),
        }
        self.written += src.len() as u64;
        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(f) = &mut self.spill {
            f.flush()?;
        }
        Ok(())
    }
}

impl OutputStream for PayloadSink {
    fn tell_out(&mut self) -> io::Result<u64> {
        Ok(self.written)
    }
}

/// An expanded payload: in memory, or spilled to a drop-deleted temp file.
pub enum Payload {
    InMemory(Vec<u8>),
    Spilled { len: u64, file: NamedTempFile },
}

impl Payload {
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Payload::InMemory(v) => v.len() as u64,
            Payload::Spilled { len, .. } => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a reader positioned at the start of the payload.
    pub fn reader(&self) -> io::Result<PayloadReader<'_>> {
        match self {
            Payload::InMemory(v) => Ok(PayloadReader::Mem { buf: v, pos: 0 }),
            Payload::Spilled { file, len } => {
                let mut f = file.reopen()?;
                f.seek(SeekFrom::Start(0))?;
                Ok(PayloadReader::File { file: f, len: *len })
            }
        }
    }

    /// Materialize the payload into memory.
    ///
    /// Used by handlers that need random access (GIF diffing, recursion
    /// input); callers should prefer `reader()` for sequential access.
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        match self {
            Payload::InMemory(v) => Ok(v.clone()),
            Payload::Spilled { file, len } => {
                let mut f = file.reopen()?;
                f.seek(SeekFrom::Start(0))?;
                let mut out = Vec::with_capacity(*len as usize);
                f.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::InMemory(v)
    }
}

/// Sequential reader over a payload; also a seekable [`InputStream`] so a
/// payload can serve as recursion input.
pub enum PayloadReader<'a> {
    Mem { buf: &'a [u8], pos: usize },
    File { file: File, len: u64 },
}

impl Read for PayloadReader<'_> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            PayloadReader::Mem { buf, pos } => {
                let avail = buf.len().saturating_sub(*pos);
                let n = avail.min(dst.len());
                dst[..n].copy_from_slice(&buf[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            PayloadReader::File { file, .. } => file.read(dst),
        }
    }
}

impl InputStream for PayloadReader<'_> {
    fn seek_abs(&mut self, p: u64) -> io::Result<u64> {
        match self {
            PayloadReader::Mem { buf, pos } => {
                *pos = p.min(buf.len() as u64) as usize;
                Ok(*pos as u64)
            }
            PayloadReader::File { file, .. } => file.seek(SeekFrom::Start(p)),
        }
    }

    fn tell(&mut self) -> io::Result<u64> {
        match self {
            PayloadReader::Mem { pos, .. } => Ok(*pos as u64),
            PayloadReader::File { file, .. } => file.stream_position(),
        }
    }

    fn stream_len(&mut self) -> io::Result<u64> {
        match self {
            PayloadReader::Mem { buf, .. } => Ok(buf.len() as u64),
            PayloadReader::File { len, .. } => Ok(*len),
        }
    }
}
