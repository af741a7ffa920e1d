//! PCF container framing.
//!
//! # Scope
//! Stream header, record flag layout, and the serialization of the two
//! record families: deflate-layout records (zlib, gzip, zip, pdf, png, swf,
//! brute) and generic records (gif, base64, bzip2, external oracles) whose
//! format header is an opaque, self-delimiting byte string owned by the
//! handler.
//!
//! # Wire layout
//! - Stream header: `"PCF"`, version triple, reserved `0`, NUL-terminated
//!   input filename (path stripped).
//! - Literal run: `0x00, vli(len), bytes`; `vli(0)` terminates the stream.
//! - Record: `flags:u8` (bit 0 set), `tag:u8`, then the family body.
//! - Deflate body: `[params]` iff perfect, `vli(hdr_len) hdr`,
//!   `vli(penalty_len) penalties`, `[vli(recon_len) recon]` iff non-perfect,
//!   `vli(original_size) vli(precompressed_size)`, `[vli(recursion_len)]`
//!   iff flag bit 7, optional BMP header (PDF image hints), payload.
//! - Generic body: header bytes, `vli(penalty_len) penalties`, sizes,
//!   `[vli(recursion_len)]`, payload.
//!
//! # Invariants
//! - The penalty count is always present (0 when the list is empty), so the
//!   framing is self-describing.
//! - Penalty offsets are serialized big-endian and strictly increasing.

use std::io::{self, Read, Write};

use crate::deflate::{PenaltyByte, ReencodeSpec, MAX_PENALTY_BYTES, PENALTY_ENTRY_BYTES};
use crate::error::{PrecompError, Result};
use crate::formats::FormatTag;
use crate::spill::Payload;
use crate::stream::fast_copy;
use crate::vli::{read_u32_be, read_u8, read_vli, write_u32_be, write_vli};

/// Container magic.
pub const PCF_MAGIC: [u8; 3] = *b"PCF";

/// Container version triple (major, minor, patch).
pub const PCF_VERSION: (u8, u8, u8) = (0, 4, 8);

/// Record marker: always set on a non-literal record's flags byte.
pub const FLAG_PRECOMPRESSED: u8 = 0b0000_0001;
/// Deflate records: set when reconstruction needs a recon blob instead of
/// compressor parameters.
pub const FLAG_NON_PERFECT: u8 = 0b0000_0010;
/// Set when the payload was recursively precompressed.
pub const FLAG_RECURSION: u8 = 0b1000_0000;
/// Perfect deflate records store the compression level in flags bits 2-5.
pub const COMP_LEVEL_SHIFT: u32 = 2;
const COMP_LEVEL_MASK: u8 = 0b0011_1100;

/// PDF image hint in flags bits 7-6 (mask values used directly).
pub const FLAG_PDF_BMP_8BPP: u8 = 0b0100_0000;
pub const FLAG_PDF_BMP_24BPP: u8 = 0b1000_0000;
const PDF_BMP_MASK: u8 = 0b1100_0000;

/// BMP wrapping hint attached to PDF image records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BmpHint {
    #[default]
    None,
    Bpp8 {
        width: u32,
        height: u32,
    },
    Bpp24 {
        width: u32,
        height: u32,
    },
}

impl BmpHint {
    #[must_use]
    pub fn flag_bits(self) -> u8 {
        match self {
            BmpHint::None => 0,
            BmpHint::Bpp8 { .. } => FLAG_PDF_BMP_8BPP,
            BmpHint::Bpp24 { .. } => FLAG_PDF_BMP_24BPP,
        }
    }

    /// Bytes per image row before 4-byte alignment.
    #[must_use]
    pub fn width_bytes(self) -> u32 {
        match self {
            BmpHint::None => 0,
            BmpHint::Bpp8 { width, .. } => width,
            BmpHint::Bpp24 { width, .. } => width * 3,
        }
    }
}

/// Extract the PDF BMP hint kind from a record's flags byte.
#[must_use]
pub fn pdf_bmp_bits(flags: u8) -> u8 {
    flags & PDF_BMP_MASK
}

/// Deflate-family record header (write side).
#[derive(Clone, Debug)]
pub struct DeflateHeader {
    pub spec: ReencodeSpec,
    /// Reconstructed per-format prefix (zlib bytes, gzip prefix, ...).
    pub stream_hdr: Vec<u8>,
    /// Store the last header byte incremented by one (restored on read).
    pub inc_last_hdr_byte: bool,
}

/// A complete record as produced by a handler, ready for serialization.
pub struct PrecompRecord {
    pub tag: FormatTag,
    /// Format-specific flag bits (PDF BMP hint); OR-ed into the flags byte.
    pub format_flag_bits: u8,
    pub header: RecordHeader,
    pub penalties: Vec<PenaltyByte>,
    /// Bytes consumed from the original input at the probe position.
    pub original_size: u64,
    /// Expanded payload size (pre-recursion).
    pub precompressed_size: u64,
    pub payload: Payload,
    /// Set by the recursion engine when the payload was replaced by a
    /// nested container stream.
    pub recursion_length: Option<u64>,
    pub bmp: BmpHint,
}

pub enum RecordHeader {
    Deflate(DeflateHeader),
    /// Self-delimiting header bytes owned by the handler.
    Generic(Vec<u8>),
}

impl PrecompRecord {
    /// Whether the recursion engine may replace this record's payload.
    ///
    /// PDF records own flags bits 6-7 for the BMP hint, so they can never
    /// carry the recursion bit; external-oracle and GIF payloads are not
    /// container material either.
    #[must_use]
    pub fn recursion_capable(&self) -> bool {
        !matches!(
            self.tag,
            FormatTag::Pdf | FormatTag::Jpeg | FormatTag::Mp3 | FormatTag::Gif
        )
    }
}

// ----------------------------------------------------------------------------
// Stream header
// ----------------------------------------------------------------------------

pub fn write_stream_header<W: Write + ?Sized>(
    out: &mut W,
    input_file_name: &str,
) -> io::Result<()> {
    out.write_all(&PCF_MAGIC)?;
    out.write_all(&[PCF_VERSION.0, PCF_VERSION.1, PCF_VERSION.2])?;
    // Reserved (was on-the-fly compression method).
    out.write_all(&[0])?;
    let name = input_file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(input_file_name);
    out.write_all(name.as_bytes())?;
    out.write_all(&[0])?;
    Ok(())
}

/// Parse and validate the stream header, returning the embedded filename.
pub fn read_stream_header<R: Read + ?Sized>(input: &mut R) -> Result<String> {
    let mut magic = [0u8; 3];
    input
        .read_exact(&mut magic)
        .map_err(|_| PrecompError::HeaderMissing)?;
    if magic != PCF_MAGIC {
        return Err(PrecompError::HeaderMissing);
    }
    let mut ver = [0u8; 3];
    input.read_exact(&mut ver)?;
    if ver != [PCF_VERSION.0, PCF_VERSION.1, PCF_VERSION.2] {
        return Err(PrecompError::HeaderVersionMismatch {
            major: ver[0],
            minor: ver[1],
            patch: ver[2],
        });
    }
    let reserved = read_u8(input)?;
    if reserved != 0 {
        return Err(PrecompError::HeaderVersionMismatch {
            major: ver[0],
            minor: ver[1],
            patch: ver[2],
        });
    }
    let mut name = Vec::new();
    loop {
        let c = read_u8(input)?;
        if c == 0 {
            break;
        }
        name.push(c);
    }
    Ok(String::from_utf8_lossy(&name).into_owned())
}

// ----------------------------------------------------------------------------
// Penalty block
// ----------------------------------------------------------------------------

pub fn write_penalties<W: Write + ?Sized>(
    out: &mut W,
    penalties: &[PenaltyByte],
) -> io::Result<()> {
    debug_assert!(penalties.len() * PENALTY_ENTRY_BYTES <= MAX_PENALTY_BYTES);
    write_vli(out, (penalties.len() * PENALTY_ENTRY_BYTES) as u64)?;
    for p in penalties {
        write_u32_be(out, p.offset)?;
        out.write_all(&[p.byte])?;
    }
    Ok(())
}

pub fn read_penalties<R: Read + ?Sized>(input: &mut R) -> io::Result<Vec<PenaltyByte>> {
    let byte_count = read_vli(input)? as usize;
    if byte_count % PENALTY_ENTRY_BYTES != 0 || byte_count > MAX_PENALTY_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed penalty block",
        ));
    }
    let n = byte_count / PENALTY_ENTRY_BYTES;
    let mut out = Vec::with_capacity(n);
    let mut prev: Option<u32> = None;
    for _ in 0..n {
        let offset = read_u32_be(input)?;
        let byte = read_u8(input)?;
        if let Some(p) = prev {
            if offset <= p {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "penalty offsets not increasing",
                ));
            }
        }
        prev = Some(offset);
        out.push(PenaltyByte { offset, byte });
    }
    Ok(out)
}

// ----------------------------------------------------------------------------
// Record writer
// ----------------------------------------------------------------------------

/// Serialize a record, payload included.
pub fn write_record<W: Write + ?Sized>(out: &mut W, rec: &PrecompRecord) -> io::Result<()> {
    let mut flags = FLAG_PRECOMPRESSED | rec.format_flag_bits;
    if rec.recursion_length.is_some() {
        flags |= FLAG_RECURSION;
    }

    match &rec.header {
        RecordHeader::Deflate(hdr) => {
            match &hdr.spec {
                ReencodeSpec::ZlibParams { comp_level, .. } => {
                    flags |= (comp_level << COMP_LEVEL_SHIFT) & COMP_LEVEL_MASK;
                }
                ReencodeSpec::Recon(_) => flags |= FLAG_NON_PERFECT,
            }
            out.write_all(&[flags, rec.tag.as_u8()])?;
            if let ReencodeSpec::ZlibParams {
                mem_level,
                window_bits,
                ..
            } = &hdr.spec
            {
                out.write_all(&[((window_bits - 8) << 4) | mem_level])?;
            }
            write_vli(out, hdr.stream_hdr.len() as u64)?;
            if hdr.inc_last_hdr_byte {
                let (head, last) = hdr
                    .stream_hdr
                    .split_at(hdr.stream_hdr.len().saturating_sub(1));
                out.write_all(head)?;
                if let Some(&b) = last.first() {
                    out.write_all(&[b.wrapping_add(1)])?;
                }
            } else {
                out.write_all(&hdr.stream_hdr)?;
            }
            write_penalties(out, &rec.penalties)?;
            if let ReencodeSpec::Recon(blob) = &hdr.spec {
                write_vli(out, blob.len() as u64)?;
                out.write_all(blob)?;
            }
        }
        RecordHeader::Generic(bytes) => {
            out.write_all(&[flags, rec.tag.as_u8()])?;
            out.write_all(bytes)?;
            write_penalties(out, &rec.penalties)?;
        }
    }

    write_vli(out, rec.original_size)?;
    write_vli(out, rec.precompressed_size)?;
    if let Some(len) = rec.recursion_length {
        write_vli(out, len)?;
    }

    if rec.bmp != BmpHint::None {
        write_bmp_header(out, rec.bmp)?;
        return write_bmp_padded_payload(out, rec);
    }

    let mut reader = rec.payload.reader()?;
    let payload_len = rec.recursion_length.unwrap_or(rec.precompressed_size);
    debug_assert_eq!(rec.payload.len(), payload_len);
    fast_copy(&mut reader, out, payload_len)
}

/// Deflate record header as parsed during recompression.
#[derive(Debug)]
pub struct DeflateHeaderData {
    pub spec: ReencodeSpec,
    pub stream_hdr: Vec<u8>,
    pub penalties: Vec<PenaltyByte>,
    pub original_size: u64,
    pub precompressed_size: u64,
    pub recursion_length: Option<u64>,
    /// Raw flags byte; format-specific bits live in 6-7.
    pub flags: u8,
}

/// Parse the deflate-family record body up to (not including) the payload.
/// `recursion_in_flags` is false for formats that repurpose flags bit 7
/// (PDF's BMP hint); everyone else reads a recursion length when it is set.
pub fn read_deflate_header<R: Read + ?Sized>(
    input: &mut R,
    flags: u8,
    inc_last_hdr_byte: bool,
    recursion_in_flags: bool,
) -> io::Result<DeflateHeaderData> {
    let perfect = flags & FLAG_NON_PERFECT == 0;
    let mut spec = if perfect {
        let params = read_u8(input)?;
        ReencodeSpec::ZlibParams {
            comp_level: (flags & COMP_LEVEL_MASK) >> COMP_LEVEL_SHIFT,
            mem_level: params & 0x0F,
            window_bits: (params >> 4) + 8,
        }
    } else {
        ReencodeSpec::Recon(Vec::new())
    };

    let hdr_len = read_vli(input)? as usize;
    let mut stream_hdr = vec![0u8; hdr_len];
    input.read_exact(&mut stream_hdr)?;
    if inc_last_hdr_byte {
        if let Some(last) = stream_hdr.last_mut() {
            *last = last.wrapping_sub(1);
        }
    }

    let penalties = read_penalties(input)?;

    if let ReencodeSpec::Recon(blob) = &mut spec {
        let len = read_vli(input)? as usize;
        let mut data = vec![0u8; len];
        input.read_exact(&mut data)?;
        *blob = data;
    }

    let original_size = read_vli(input)?;
    let precompressed_size = read_vli(input)?;
    let recursion_length = if recursion_in_flags && flags & FLAG_RECURSION != 0 {
        Some(read_vli(input)?)
    } else {
        None
    };

    Ok(DeflateHeaderData {
        spec,
        stream_hdr,
        penalties,
        original_size,
        precompressed_size,
        recursion_length,
        flags,
    })
}

/// Tail fields shared by generic records: penalties, sizes, recursion.
#[derive(Debug)]
pub struct GenericTail {
    pub penalties: Vec<PenaltyByte>,
    pub original_size: u64,
    pub precompressed_size: u64,
    pub recursion_length: Option<u64>,
}

pub fn read_generic_tail<R: Read + ?Sized>(input: &mut R, flags: u8) -> io::Result<GenericTail> {
    let penalties = read_penalties(input)?;
    let original_size = read_vli(input)?;
    let precompressed_size = read_vli(input)?;
    let recursion_length = if flags & FLAG_RECURSION != 0 {
        Some(read_vli(input)?)
    } else {
        None
    };
    Ok(GenericTail {
        penalties,
        original_size,
        precompressed_size,
        recursion_length,
    })
}

// ----------------------------------------------------------------------------
// BMP wrapping (PDF image records)
// ----------------------------------------------------------------------------

const BMP_HEADER_SIZE: u32 = 54;
const BMP_PALETTE_SIZE: u32 = 1024;

/// Synthesize the BMP header the PDF handler promised via its hint.
///
/// The header makes the expanded payload a viewable BMP for the downstream
/// compressor; recompression skips it entirely.
pub fn write_bmp_header<W: Write + ?Sized>(out: &mut W, hint: BmpHint) -> io::Result<()> {
    let (width, height, bpp) = match hint {
        BmpHint::None => return Ok(()),
        BmpHint::Bpp8 { width, height } => (width, height, 8u8),
        BmpHint::Bpp24 { width, height } => (width, height, 24u8),
    };

    out.write_all(b"BM")?;
    let row = (hint.width_bytes() + 3) & !3;
    let data_size = row * height;
    let file_size = data_size
        + BMP_HEADER_SIZE
        + if bpp == 8 { BMP_PALETTE_SIZE } else { 0 };
    crate::vli::write_u32_le(out, file_size)?;
    out.write_all(&[0, 0, 0, 0])?;
    let data_offset = BMP_HEADER_SIZE + if bpp == 8 { BMP_PALETTE_SIZE } else { 0 };
    crate::vli::write_u32_le(out, data_offset)?;
    crate::vli::write_u32_le(out, 40)?; // BITMAPINFOHEADER
    crate::vli::write_u32_le(out, width)?;
    crate::vli::write_u32_le(out, height)?;
    out.write_all(&[1, 0, bpp, 0])?; // planes, bit depth
    out.write_all(&[0u8; 16])?; // compression, image size, ppm x/y
    out.write_all(&[0u8; 8])?; // palette counts
    if bpp == 8 {
        out.write_all(&[0u8; BMP_PALETTE_SIZE as usize])?;
    }
    Ok(())
}

fn write_bmp_padded_payload<W: Write + ?Sized>(out: &mut W, rec: &PrecompRecord) -> io::Result<()> {
    let width_bytes = rec.bmp.width_bytes();
    let mut reader = rec.payload.reader()?;
    if width_bytes % 4 == 0 {
        return fast_copy(&mut reader, out, rec.precompressed_size);
    }
    let height = match rec.bmp {
        BmpHint::Bpp8 { height, .. } | BmpHint::Bpp24 { height, .. } => height,
        BmpHint::None => unreachable!("padded payload without hint"),
    };
    let pad = [0u8; 3];
    let pad_len = (4 - (width_bytes % 4) as usize) % 4;
    for _ in 0..height {
        fast_copy(&mut reader, out, u64::from(width_bytes))?;
        out.write_all(&pad[..pad_len])?;
    }
    Ok(())
}

/// Size on the wire of a BMP-padded payload.
#[must_use]
pub fn bmp_padded_len(hint: BmpHint, precompressed_size: u64) -> u64 {
    let width_bytes = hint.width_bytes();
    if width_bytes == 0 || width_bytes % 4 == 0 {
        return precompressed_size;
    }
    let height = match hint {
        BmpHint::Bpp8 { height, .. } | BmpHint::Bpp24 { height, .. } => u64::from(height),
        BmpHint::None => 0,
    };
    let row = u64::from((width_bytes + 3) & !3);
    row * height
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemStream;

    #[test]
    fn stream_header_roundtrip() {
        let mut buf = Vec::new();
        write_stream_header(&mut buf, "/some/dir/archive.bin").unwrap();
        assert_eq!(&buf[..3], b"PCF");
        let name = read_stream_header(&mut MemStream::from_vec(buf)).unwrap();
        assert_eq!(name, "archive.bin");
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let err = read_stream_header(&mut MemStream::from_vec(b"XYZ\0\0\0\0x\0".to_vec()))
            .unwrap_err();
        assert!(matches!(err, PrecompError::HeaderMissing));

        let mut buf = Vec::new();
        write_stream_header(&mut buf, "f").unwrap();
        buf[3] = 99; // clobber major version
        let err = read_stream_header(&mut MemStream::from_vec(buf)).unwrap_err();
        assert!(matches!(
            err,
            PrecompError::HeaderVersionMismatch { major: 99, .. }
        ));
    }

    #[test]
    fn penalties_roundtrip_and_ordering_enforced() {
        let list = vec![
            PenaltyByte { offset: 3, byte: 7 },
            PenaltyByte {
                offset: 100,
                byte: 0xFF,
            },
        ];
        let mut buf = Vec::new();
        write_penalties(&mut buf, &list).unwrap();
        let back = read_penalties(&mut MemStream::from_vec(buf)).unwrap();
        assert_eq!(back, list);

        // Non-increasing offsets must be rejected.
        let mut bad = Vec::new();
        write_vli(&mut bad, 10).unwrap();
        for _ in 0..2 {
            write_u32_be(&mut bad, 5).unwrap();
            bad.push(1);
        }
        assert!(read_penalties(&mut MemStream::from_vec(bad)).is_err());
    }

    #[test]
    fn deflate_record_roundtrips_field_for_field() {
        let rec = PrecompRecord {
            tag: FormatTag::Gzip,
            format_flag_bits: 0,
            header: RecordHeader::Deflate(DeflateHeader {
                spec: ReencodeSpec::ZlibParams {
                    comp_level: 6,
                    mem_level: 8,
                    window_bits: 15,
                },
                stream_hdr: vec![0x1F, 0x8B, 0x08, 0x00],
                inc_last_hdr_byte: false,
            }),
            penalties: vec![PenaltyByte { offset: 9, byte: 1 }],
            original_size: 123,
            precompressed_size: 5,
            payload: Payload::from(b"hello".to_vec()),
            recursion_length: None,
            bmp: BmpHint::None,
        };
        let mut buf = Vec::new();
        write_record(&mut buf, &rec).unwrap();

        let mut input = MemStream::from_vec(buf);
        let flags = read_u8(&mut input).unwrap();
        assert_eq!(flags & FLAG_PRECOMPRESSED, FLAG_PRECOMPRESSED);
        assert_eq!(flags & FLAG_NON_PERFECT, 0);
        let tag = read_u8(&mut input).unwrap();
        assert_eq!(tag, FormatTag::Gzip.as_u8());

        let hdr = read_deflate_header(&mut input, flags, false, true).unwrap();
        assert_eq!(
            hdr.spec,
            ReencodeSpec::ZlibParams {
                comp_level: 6,
                mem_level: 8,
                window_bits: 15
            }
        );
        assert_eq!(hdr.stream_hdr, vec![0x1F, 0x8B, 0x08, 0x00]);
        assert_eq!(hdr.penalties, rec.penalties);
        assert_eq!(hdr.original_size, 123);
        assert_eq!(hdr.precompressed_size, 5);
        assert_eq!(hdr.recursion_length, None);

        let mut payload = [0u8; 5];
        input.read_exact(&mut payload).unwrap();
        assert_eq!(&payload, b"hello");
    }

    #[test]
    fn recon_record_roundtrips() {
        let rec = PrecompRecord {
            tag: FormatTag::ZlibRaw,
            format_flag_bits: 0,
            header: RecordHeader::Deflate(DeflateHeader {
                spec: ReencodeSpec::Recon(vec![1, 2, 3]),
                stream_hdr: vec![0x78, 0x9C],
                inc_last_hdr_byte: false,
            }),
            penalties: Vec::new(),
            original_size: 10,
            precompressed_size: 4,
            payload: Payload::from(b"data".to_vec()),
            recursion_length: None,
            bmp: BmpHint::None,
        };
        let mut buf = Vec::new();
        write_record(&mut buf, &rec).unwrap();

        let mut input = MemStream::from_vec(buf);
        let flags = read_u8(&mut input).unwrap();
        assert_eq!(flags & FLAG_NON_PERFECT, FLAG_NON_PERFECT);
        let _tag = read_u8(&mut input).unwrap();
        let hdr = read_deflate_header(&mut input, flags, false, true).unwrap();
        assert_eq!(hdr.spec, ReencodeSpec::Recon(vec![1, 2, 3]));
    }

    #[test]
    fn inc_last_hdr_byte_is_reversible() {
        let rec = PrecompRecord {
            tag: FormatTag::Zip,
            format_flag_bits: 0,
            header: RecordHeader::Deflate(DeflateHeader {
                spec: ReencodeSpec::ZlibParams {
                    comp_level: 1,
                    mem_level: 8,
                    window_bits: 15,
                },
                stream_hdr: vec![0x50, 0x4B, 0x99],
                inc_last_hdr_byte: true,
            }),
            penalties: Vec::new(),
            original_size: 1,
            precompressed_size: 0,
            payload: Payload::from(Vec::new()),
            recursion_length: None,
            bmp: BmpHint::None,
        };
        let mut buf = Vec::new();
        write_record(&mut buf, &rec).unwrap();

        let mut input = MemStream::from_vec(buf);
        let flags = read_u8(&mut input).unwrap();
        let _ = read_u8(&mut input).unwrap();
        let hdr = read_deflate_header(&mut input, flags, true, true).unwrap();
        // The stored byte was 0x9A on the wire; the reader restores 0x99.
        assert_eq!(hdr.stream_hdr, vec![0x50, 0x4B, 0x99]);
    }

    #[test]
    fn bmp_header_sizes() {
        let h8 = BmpHint::Bpp8 {
            width: 5,
            height: 2,
        };
        let mut buf = Vec::new();
        write_bmp_header(&mut buf, h8).unwrap();
        assert_eq!(buf.len(), 54 + 1024);
        assert_eq!(&buf[..2], b"BM");

        let h24 = BmpHint::Bpp24 {
            width: 4,
            height: 2,
        };
        assert_eq!(bmp_padded_len(h24, 24), 24); // 12-byte rows, no padding
        let h24odd = BmpHint::Bpp24 {
            width: 3,
            height: 2,
        };
        assert_eq!(bmp_padded_len(h24odd, 18), 24); // 9 -> 12 per row
    }
}
