//! End-to-end round-trip tests.
//!
//! # Scope
//! Every format handler is exercised through the public lifecycle:
//! synthesize a fixture, precompress, assert the stream shape where it is
//! pinned down, recompress, and require bit-exact equality with the input.
//!
//! # Assumptions
//! - Fixtures are compressed with the same flate2/bzip2 builds the library
//!   reencodes with, so parameter trials find exact matches.

use std::io::Write as _;
use std::sync::Arc;

use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;

use precomp_rs::config::Switches;
use precomp_rs::error::ReturnCode;
use precomp_rs::formats::FormatTag;
use precomp_rs::Precomp;

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn zlib_compress(data: &[u8], level: u32) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(level));
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn raw_deflate(data: &[u8], level: u32) -> Vec<u8> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::new(level));
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn gzip_compress(data: &[u8], level: u32) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::new(level));
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn configure(p: &mut Precomp, f: impl FnOnce(&mut Switches)) {
    f(p.switches_mut());
}

fn precompress(input: &[u8], f: impl FnOnce(&mut Switches)) -> (Vec<u8>, ReturnCode) {
    let mut p = Precomp::new();
    configure(&mut p, f);
    p.set_input_bytes(input.to_vec(), "fixture.bin");
    p.set_output_bytes();
    let code = p.precompress();
    (p.take_output().unwrap(), code)
}

fn recompress(pcf: &[u8], f: impl FnOnce(&mut Switches)) -> Vec<u8> {
    let mut p = Precomp::new();
    configure(&mut p, f);
    p.set_input_bytes(pcf.to_vec(), "fixture.bin.pcf");
    p.set_output_bytes();
    assert_eq!(p.recompress(), ReturnCode::Success);
    p.take_output().unwrap()
}

/// Precompress, require at least one record, recompress, compare.
fn assert_roundtrip_found(input: &[u8], f: impl Fn(&mut Switches)) -> Vec<u8> {
    let (pcf, code) = precompress(input, &f);
    assert_eq!(code, ReturnCode::Success, "no stream was claimed");
    let back = recompress(&pcf, &f);
    assert_eq!(back, input, "round trip diverged");
    pcf
}

/// Offset of the first byte after the stream header for our fixture name.
fn header_len() -> usize {
    3 + 3 + 1 + "fixture.bin".len() + 1
}

fn semi_compressible(len: usize) -> Vec<u8> {
    let mut state = 0x243F_6A88u32;
    (0..len)
        .map(|i| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            if i % 3 == 0 {
                b'a' + (i % 17) as u8
            } else {
                (state >> 24) as u8
            }
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Spec scenarios
// ----------------------------------------------------------------------------

#[test]
fn literal_only_hello() {
    let (pcf, code) = precompress(b"Hello", |_| {});
    assert_eq!(code, ReturnCode::NothingDecompressed);
    assert_eq!(
        &pcf[header_len()..],
        &[0x00, 0x05, b'H', b'e', b'l', b'l', b'o', 0x00, 0x00]
    );
    assert_eq!(recompress(&pcf, |_| {}), b"Hello");
}

#[test]
fn raw_zlib_with_default_parameters() {
    let input = zlib_compress(b"ABCDEFGH", 6);
    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.intense_mode = true;
    });

    // First record starts right after the header: perfect deflate record,
    // level 6 in flags bits 2-5, zlib tag, params byte (15, 8).
    let rec = &pcf[header_len()..];
    assert_eq!(rec[0], 0b0000_0001 | (6 << 2));
    assert_eq!(rec[1], FormatTag::ZlibRaw.as_u8());
    assert_eq!(rec[2], ((15 - 8) << 4) | 8);
    // Stored header is the two zlib prefix bytes.
    assert_eq!(rec[3], 2);
    assert_eq!(&rec[4..6], &input[..2]);
}

#[test]
fn raw_zlib_with_verification_enabled() {
    let input = zlib_compress(&semi_compressible(20_000), 6);
    assert_roundtrip_found(&input, |sw| {
        sw.intense_mode = true;
        sw.preflate_verify = true;
        sw.max_recursion_depth = 0;
    });
}

#[test]
fn gzip_with_filename_header() {
    // gzip with FNAME set: magic, deflate CM, FNAME flag, mtime, xfl, os,
    // name, then the deflate stream of "precomp".
    let mut input = vec![0x1F, 0x8B, 0x08, 0x08, 0, 0, 0, 0, 0, 0x03];
    input.extend_from_slice(b"name.txt\0");
    input.extend_from_slice(&raw_deflate(b"precomp-fixture-payload", 6));
    input.extend_from_slice(&[0u8; 8]); // crc + isize (literal tail)

    let pcf = assert_roundtrip_found(&input, |_| {});
    let rec = &pcf[header_len()..];
    assert_eq!(rec[1], FormatTag::Gzip.as_u8());
}

#[test]
fn pdf_image_24bpp_gets_bmp_hint() {
    // 4x2 24-bit image: 24 payload bytes, width bytes 12 (already aligned).
    let image: Vec<u8> = (0u8..24).collect();
    let mut input = Vec::new();
    input.extend_from_slice(
        b"<< /Type /XObject /Width 4 /Height 2 /BitsPerComponent 8 /Filter /FlateDecode >> stream\n",
    );
    input.extend_from_slice(&zlib_compress(&image, 6));
    input.extend_from_slice(b"\nendstream");

    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.pdf_bmp_mode = true;
        sw.min_ident_size = 1;
    });

    // The record begins after the literal run covering the dictionary up to
    // the "/FlateDecode" keyword.
    let keyword_at = input.windows(12).position(|w| w == b"/FlateDecode").unwrap();
    let mut at = header_len();
    // literal run: 0x00, vli(len), bytes
    assert_eq!(pcf[at], 0x00);
    at += 1;
    assert_eq!(pcf[at] as usize, keyword_at); // fits one vli byte
    at += 1 + keyword_at;
    let flags = pcf[at];
    assert_eq!(flags & 0b1100_0000, 0b1000_0000, "24bpp hint bits");
    assert_eq!(pcf[at + 1], FormatTag::Pdf.as_u8());
}

#[test]
fn brute_false_positive_repeating_pattern() {
    let input: Vec<u8> = [0xEB, 0xE1, 0xF1]
        .iter()
        .copied()
        .cycle()
        .take(4096)
        .collect();
    let (pcf, code) = precompress(&input, |sw| {
        sw.brute_mode = true;
    });
    assert_eq!(code, ReturnCode::NothingDecompressed);
    // Single literal run, no records.
    assert_eq!(pcf[header_len()], 0x00);
    assert_eq!(recompress(&pcf, |_| {}), input);
}

#[test]
fn recursive_gzip_around_zlib() {
    // The outer gzip wraps a raw zlib stream large enough to trigger nested
    // precompression; the nested pass needs intense mode to claim it.
    let inner_payload = semi_compressible(120_000);
    let inner_zlib = zlib_compress(&inner_payload, 6);
    assert!(inner_zlib.len() > 16 * 1024, "fixture too small to recurse");
    let input = gzip_compress(&inner_zlib, 6);

    let cfg = |sw: &mut Switches| {
        sw.intense_mode = true;
    };
    let mut p = Precomp::new();
    configure(&mut p, cfg);
    p.set_input_bytes(input.clone(), "fixture.bin");
    p.set_output_bytes();
    assert_eq!(p.precompress(), ReturnCode::Success);
    let pcf = p.take_output().unwrap();

    // Outer record carries the recursion bit; the nested pass claimed the
    // inner zlib stream.
    let rec = &pcf[header_len()..];
    assert_eq!(rec[0] & 0b1000_0000, 0b1000_0000, "recursion flag");
    assert_eq!(rec[1], FormatTag::Gzip.as_u8());
    assert!(p.statistics().recompressed[FormatTag::ZlibRaw.as_usize()] >= 1);
    assert!(p.recursion_state().max_depth_used >= 1);

    assert_eq!(recompress(&pcf, cfg), input);
}

#[test]
fn recursion_depth_zero_still_roundtrips() {
    let inner_zlib = zlib_compress(&semi_compressible(120_000), 6);
    let input = gzip_compress(&inner_zlib, 6);
    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.intense_mode = true;
        sw.max_recursion_depth = 0;
    });
    let rec = &pcf[header_len()..];
    assert_eq!(rec[0] & 0b1000_0000, 0, "no recursion at depth limit 0");
}

// ----------------------------------------------------------------------------
// Per-format round trips
// ----------------------------------------------------------------------------

#[test]
fn zip_local_entry() {
    let payload = semi_compressible(30_000);
    let deflated = raw_deflate(&payload, 6);
    let name = b"data/blob.bin";

    let mut input = Vec::new();
    input.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04]);
    input.extend_from_slice(&[20, 0, 0, 0, 8, 0]); // version, flags, method
    input.extend_from_slice(&[0u8; 8]); // mtime + crc
    input.extend_from_slice(&(deflated.len() as u32).to_le_bytes());
    input.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    input.extend_from_slice(&(name.len() as u16).to_le_bytes());
    input.extend_from_slice(&[0, 0]); // extra len
    input.extend_from_slice(name);
    input.extend_from_slice(&deflated);
    input.extend_from_slice(b"PK\x01\x02 central directory stub");

    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.max_recursion_depth = 0;
    });
    assert_eq!(pcf[header_len() + 1], FormatTag::Zip.as_u8());
}

fn png_chunk(tag: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut c = Vec::new();
    c.extend_from_slice(&(data.len() as u32).to_be_bytes());
    c.extend_from_slice(tag);
    c.extend_from_slice(data);
    let mut h = crc32fast::Hasher::new();
    h.update(tag);
    h.update(data);
    c.extend_from_slice(&h.finalize().to_be_bytes());
    c
}

#[test]
fn png_single_idat() {
    let zlib = zlib_compress(&semi_compressible(8_000), 6);
    let mut input = b"\x89PNG\r\n\x1a\n".to_vec();
    input.extend_from_slice(&png_chunk(b"IHDR", &[0u8; 13]));
    input.extend_from_slice(&png_chunk(b"IDAT", &zlib));
    input.extend_from_slice(&png_chunk(b"IEND", b""));

    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.max_recursion_depth = 0;
    });
    // Find the record tag: first record in the stream.
    let body = &pcf[header_len()..];
    let lit_len = body[1] as usize;
    assert_eq!(body[2 + lit_len + 1], FormatTag::Png.as_u8());
}

#[test]
fn png_multi_idat() {
    let zlib = zlib_compress(&semi_compressible(40_000), 6);
    let (a, rest) = zlib.split_at(1000);
    let (b, c) = rest.split_at(rest.len() / 2);

    let mut input = b"\x89PNG\r\n\x1a\n".to_vec();
    input.extend_from_slice(&png_chunk(b"IHDR", &[0u8; 13]));
    input.extend_from_slice(&png_chunk(b"IDAT", a));
    input.extend_from_slice(&png_chunk(b"IDAT", b));
    input.extend_from_slice(&png_chunk(b"IDAT", c));
    input.extend_from_slice(&png_chunk(b"IEND", b""));

    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.max_recursion_depth = 0;
    });
    let body = &pcf[header_len()..];
    let lit_len = body[1] as usize;
    assert_eq!(body[2 + lit_len + 1], FormatTag::MultiPng.as_u8());
}

#[test]
fn swf_compressed_body() {
    let body = semi_compressible(25_000);
    let zlib = zlib_compress(&body, 6);
    let mut input = b"CWS\x09".to_vec();
    input.extend_from_slice(&((body.len() + 8) as u32).to_le_bytes());
    input.extend_from_slice(&zlib);

    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.max_recursion_depth = 0;
    });
    assert_eq!(pcf[header_len() + 1], FormatTag::Swf.as_u8());
}

#[test]
fn base64_mime_block() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let payload = semi_compressible(6_000);
    let text = STANDARD.encode(&payload);
    let mut input = b"Content-Transfer-Encoding: base64\r\n".to_vec();
    for chunk in text.as_bytes().chunks(76) {
        input.extend_from_slice(chunk);
        input.extend_from_slice(b"\r\n");
    }
    input.extend_from_slice(b"\r\n--boundary--\r\n");

    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.max_recursion_depth = 0;
    });
    assert!(pcf.len() > header_len());
}

#[test]
fn base64_wrapped_gzip_recurses() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let gz = gzip_compress(&semi_compressible(120_000), 6);
    assert!(gz.len() > 16 * 1024);
    let text = STANDARD.encode(&gz);
    let mut input = b"base64\n".to_vec();
    for chunk in text.as_bytes().chunks(64) {
        input.extend_from_slice(chunk);
        input.push(b'\n');
    }

    let cfg = |_: &mut Switches| {};
    let mut p = Precomp::new();
    p.set_input_bytes(input.clone(), "fixture.bin");
    p.set_output_bytes();
    assert_eq!(p.precompress(), ReturnCode::Success);
    assert!(p.statistics().recompressed[FormatTag::Base64.as_usize()] >= 1);
    assert!(p.statistics().recompressed[FormatTag::Gzip.as_usize()] >= 1);
    let pcf = p.take_output().unwrap();
    assert_eq!(recompress(&pcf, cfg), input);
}

#[test]
fn bzip2_stream() {
    let payload = semi_compressible(50_000);
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(7));
    enc.write_all(&payload).unwrap();
    let mut input = enc.finish().unwrap();
    input.extend_from_slice(b"trailing literal bytes");

    let pcf = assert_roundtrip_found(&input, |sw| {
        sw.max_recursion_depth = 0;
    });
    assert_eq!(pcf[header_len() + 1], FormatTag::Bzip2.as_u8());
}

#[test]
fn mixed_content_with_multiple_streams() {
    let mut input = b"plain prefix ".to_vec();
    input.extend_from_slice(&gzip_compress(&semi_compressible(9_000), 6));
    input.extend_from_slice(b" middle literal ");
    input.extend_from_slice(&zlib_compress(&semi_compressible(7_000), 9));
    input.extend_from_slice(b" suffix");

    let mut p = Precomp::new();
    p.switches_mut().intense_mode = true;
    p.switches_mut().max_recursion_depth = 0;
    p.set_input_bytes(input.clone(), "fixture.bin");
    p.set_output_bytes();
    assert_eq!(p.precompress(), ReturnCode::Success);
    assert!(p.statistics().recompressed[FormatTag::Gzip.as_usize()] >= 1);
    assert!(p.statistics().recompressed[FormatTag::ZlibRaw.as_usize()] >= 1);
    let pcf = p.take_output().unwrap();

    assert_eq!(
        recompress(&pcf, |sw| {
            sw.intense_mode = true;
        }),
        input
    );
}

// ----------------------------------------------------------------------------
// External oracle contracts
// ----------------------------------------------------------------------------

/// Trivial reversible "repacker" used to exercise the oracle plumbing.
struct XorCodec;

impl precomp_rs::formats::JpegCodec for XorCodec {
    fn pack(&self, jpeg: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
        Ok(Some(jpeg.iter().map(|b| b ^ 0x5A).collect()))
    }

    fn unpack(&self, packed: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
        Ok(Some(packed.iter().map(|b| b ^ 0x5A).collect()))
    }
}

impl precomp_rs::formats::Mp3Codec for XorCodec {
    fn pack(&self, frames: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
        Ok(Some(frames.iter().map(|b| b ^ 0xA5).collect()))
    }

    fn unpack(&self, packed: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
        Ok(Some(packed.iter().map(|b| b ^ 0xA5).collect()))
    }
}

#[test]
fn jpeg_oracle_roundtrip() {
    let mut input = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    input.extend_from_slice(&semi_compressible(500));
    input.extend_from_slice(&[0xFF, 0xD9]);
    input.extend_from_slice(b"after the image");

    let mut p = Precomp::new();
    p.set_jpeg_codec(Arc::new(XorCodec));
    p.set_input_bytes(input.clone(), "fixture.bin");
    p.set_output_bytes();
    assert_eq!(p.precompress(), ReturnCode::Success);
    assert_eq!(p.statistics().recompressed[FormatTag::Jpeg.as_usize()], 1);
    let pcf = p.take_output().unwrap();

    let mut back = Precomp::new();
    back.set_jpeg_codec(Arc::new(XorCodec));
    back.set_input_bytes(pcf, "fixture.bin.pcf");
    back.set_output_bytes();
    assert_eq!(back.recompress(), ReturnCode::Success);
    assert_eq!(back.take_output().unwrap(), input);
}

#[test]
fn mp3_oracle_roundtrip() {
    // Five 417-byte MPEG-1 Layer III frames (128 kbit/s, 44.1 kHz).
    let mut input = Vec::new();
    for _ in 0..5 {
        let mut frame = vec![0xFF, 0xFA, 0x90, 0x00];
        frame.resize(417, 0xC3);
        input.extend_from_slice(&frame);
    }
    input.extend_from_slice(b"id3 tag trailer or whatever");

    let mut p = Precomp::new();
    p.set_mp3_codec(Arc::new(XorCodec));
    p.set_input_bytes(input.clone(), "fixture.bin");
    p.set_output_bytes();
    assert_eq!(p.precompress(), ReturnCode::Success);
    assert_eq!(p.statistics().recompressed[FormatTag::Mp3.as_usize()], 1);
    let pcf = p.take_output().unwrap();

    let mut back = Precomp::new();
    back.set_mp3_codec(Arc::new(XorCodec));
    back.set_input_bytes(pcf, "fixture.bin.pcf");
    back.set_output_bytes();
    assert_eq!(back.recompress(), ReturnCode::Success);
    assert_eq!(back.take_output().unwrap(), input);
}

// ----------------------------------------------------------------------------
// Failure surfaces
// ----------------------------------------------------------------------------

/// Oracle whose reconstruction blob is the original span verbatim: the
/// degenerate but contract-legal recon-data codec.
struct StoredSpanCodec;

impl precomp_rs::deflate::DeflateCodec for StoredSpanCodec {
    fn decode(
        &self,
        _input: &mut dyn precomp_rs::stream::InputStream,
        _meta_block_size: usize,
    ) -> std::io::Result<Option<precomp_rs::deflate::DeflateDecodeOutcome>> {
        Ok(None) // never claims anything while scanning
    }

    fn select_reencode(
        &self,
        _input: &mut dyn precomp_rs::stream::InputStream,
        _stream_pos: u64,
        _compressed_size: u64,
        _payload: &precomp_rs::spill::Payload,
        _window_bits_hint: u8,
    ) -> std::io::Result<Option<(precomp_rs::deflate::ReencodeSpec, Vec<precomp_rs::deflate::PenaltyByte>)>>
    {
        Ok(None)
    }

    fn reencode(
        &self,
        spec: &precomp_rs::deflate::ReencodeSpec,
        _payload: &mut dyn std::io::Read,
        _uncompressed_size: u64,
        out: &mut dyn std::io::Write,
    ) -> std::io::Result<bool> {
        match spec {
            precomp_rs::deflate::ReencodeSpec::Recon(blob) => {
                out.write_all(blob)?;
                Ok(true)
            }
            precomp_rs::deflate::ReencodeSpec::ZlibParams { .. } => Ok(false),
        }
    }
}

#[test]
fn recon_data_record_recompresses_through_the_oracle() {
    use precomp_rs::container::{
        write_record, write_stream_header, BmpHint, DeflateHeader, PrecompRecord, RecordHeader,
    };
    use precomp_rs::deflate::ReencodeSpec;
    use precomp_rs::spill::Payload;

    let original_span = b"pretend-deflate-bytes".to_vec();
    let rec = PrecompRecord {
        tag: FormatTag::ZlibRaw,
        format_flag_bits: 0,
        header: RecordHeader::Deflate(DeflateHeader {
            spec: ReencodeSpec::Recon(original_span.clone()),
            stream_hdr: vec![0x78, 0x9C],
            inc_last_hdr_byte: false,
        }),
        penalties: Vec::new(),
        original_size: 2 + original_span.len() as u64,
        precompressed_size: 9,
        payload: Payload::from(b"unpacked!".to_vec()),
        recursion_length: None,
        bmp: BmpHint::None,
    };

    let mut pcf = Vec::new();
    write_stream_header(&mut pcf, "fixture.bin").unwrap();
    write_record(&mut pcf, &rec).unwrap();
    pcf.extend_from_slice(&[0x00, 0x00]);

    let mut p = Precomp::new();
    p.set_deflate_codec(Arc::new(StoredSpanCodec));
    p.set_input_bytes(pcf, "fixture.bin.pcf");
    p.set_output_bytes();
    assert_eq!(p.recompress(), ReturnCode::Success);

    let mut expected = vec![0x78, 0x9C];
    expected.extend_from_slice(&original_span);
    assert_eq!(p.take_output().unwrap(), expected);
}

#[test]
fn unknown_tag_fails_recompression() {
    let mut pcf = Vec::new();
    precomp_rs::container::write_stream_header(&mut pcf, "x").unwrap();
    pcf.push(0x01); // record marker
    pcf.push(0xEE); // tag nobody claims

    let mut p = Precomp::new();
    p.set_input_bytes(pcf, "x.pcf");
    p.set_output_bytes();
    assert_eq!(p.recompress(), ReturnCode::DuringRecompression);
}

#[test]
fn truncated_record_fails_loudly() {
    let input = zlib_compress(&semi_compressible(5_000), 6);
    let (mut pcf, code) = precompress(&input, |sw| {
        sw.intense_mode = true;
        sw.max_recursion_depth = 0;
    });
    assert_eq!(code, ReturnCode::Success);
    pcf.truncate(pcf.len() - 10);

    let mut p = Precomp::new();
    p.set_input_bytes(pcf, "x.pcf");
    p.set_output_bytes();
    assert_ne!(p.recompress(), ReturnCode::Success);
}

#[test]
fn user_ignore_positions_suppress_detection() {
    let input = zlib_compress(&semi_compressible(5_000), 6);
    let (pcf, code) = precompress(&input, |sw| {
        sw.intense_mode = true;
        sw.ignore_set.insert(0);
    });
    assert_eq!(code, ReturnCode::NothingDecompressed);
    assert_eq!(recompress(&pcf, |_| {}), input);
}
