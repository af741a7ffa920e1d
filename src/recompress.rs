//! Record reader loop (recompress direction).
//!
//! Mirrors the scanner: a leading zero byte starts a literal run of VLI
//! length (zero length terminates the stream); anything else is a record
//! flags byte followed by the format tag, dispatched to the owning handler.
//!
//! Failures here are fatal: a record that cannot be regenerated would
//! desynchronize everything after it.

use std::io::{Read, Write};

use crate::error::{PrecompError, Result};
use crate::formats::{build_recompress_registry, FormatTag, RecompressTools};
use crate::stream::{fast_copy, InputStream};
use crate::vli::{read_u8, read_vli};

/// Replay every record from `input` into `out` until the terminator or EOF.
pub fn recompress_records(
    input: &mut dyn InputStream,
    out: &mut dyn Write,
    tools: &RecompressTools,
) -> Result<()> {
    let registry = build_recompress_registry(&tools.external);

    loop {
        let mut first = [0u8; 1];
        match input.read(&mut first) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => return Err(PrecompError::Io(err)),
        }
        let flags = first[0];

        if flags == 0 {
            let len = read_vli(input).map_err(PrecompError::Io)?;
            if len == 0 {
                break;
            }
            fast_copy(input, out, len).map_err(PrecompError::Io)?;
            continue;
        }

        let tag_byte = read_u8(input).map_err(PrecompError::Io)?;
        let tag = FormatTag::from_u8(tag_byte)
            .ok_or(PrecompError::UnsupportedStreamType(tag_byte))?;
        let handler = registry
            .iter()
            .find(|h| h.tags().contains(&tag))
            .ok_or(PrecompError::UnsupportedStreamType(tag_byte))?;

        let hdr = handler
            .read_format_header(input, flags, tag)
            .map_err(PrecompError::Io)?;
        handler.recompress(input, out, hdr, tag, tools)?;
    }
    Ok(())
}

