//! End-to-end detector tests over synthetic PNGs.
//!
//! The `Certain` cases hand-assemble a raw deflate stream whose first block
//! is a non-final dynamic-Huffman block (the shape the detector's structural
//! filter expects), then embed it behind every possible bit offset to prove
//! the realignment is offset-complete.

use std::io::Read;

use anticrop_scan::chunk::{encode_chunk, Chunk};
use anticrop_scan::{ScanConfidence, Scanner, PNG_SIGNATURE};

/// LSB-first bit accumulator matching deflate's packing rules.
#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    bit: u8,
}

impl BitWriter {
    /// Push `count` bits of `value`, least significant first (header fields
    /// and extra bits).
    fn push_bits(&mut self, value: u32, count: u8) {
        for i in 0..count {
            self.push_bit(((value >> i) & 1) as u8);
        }
    }

    fn push_bit(&mut self, bit: u8) {
        if self.bit == 0 {
            self.bytes.push(0);
        }
        if bit != 0 {
            *self.bytes.last_mut().unwrap() |= 1 << self.bit;
        }
        self.bit = (self.bit + 1) % 8;
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Builds a complete raw deflate stream decoding to `"A"`:
/// block 1 is non-final dynamic Huffman (literal `A` + end-of-block),
/// block 2 is a final static block holding only end-of-block.
fn dynamic_first_deflate_stream() -> Vec<u8> {
    let mut w = BitWriter::default();

    // Block 1 header: BFINAL=0, BTYPE=10 (dynamic).
    w.push_bits(0, 1);
    w.push_bits(0b10, 2);
    // HLIT=0 (257 literal codes), HDIST=0 (1 distance code), HCLEN=14
    // (18 code-length-code entries).
    w.push_bits(0, 5);
    w.push_bits(0, 5);
    w.push_bits(14, 4);
    // Code-length-code lengths in the fixed order
    // 16 17 18 0 8 7 9 6 10 5 11 4 12 3 13 2 14 1: symbols 18 and 1 get
    // one-bit codes (canonically 1 and 0), everything else is absent.
    for index in 0..18 {
        let len = match index {
            2 | 17 => 1,
            _ => 0,
        };
        w.push_bits(len, 3);
    }
    // Literal/length lengths: 65 zeros, len-1 for 'A', 190 zeros, len-1 for
    // end-of-block; then a single len-1 distance entry.
    w.push_bits(1, 1); // symbol 18
    w.push_bits(65 - 11, 7);
    w.push_bits(0, 1); // symbol 1 -> literal 'A'
    w.push_bits(1, 1); // symbol 18
    w.push_bits(138 - 11, 7);
    w.push_bits(1, 1); // symbol 18
    w.push_bits(52 - 11, 7);
    w.push_bits(0, 1); // symbol 1 -> end-of-block
    w.push_bits(0, 1); // symbol 1 -> distance 0
    // Data: 'A' (code 0), end-of-block (code 1).
    w.push_bits(0, 1);
    w.push_bits(1, 1);

    // Block 2: BFINAL=1, BTYPE=01 (static), end-of-block (seven zero bits).
    w.push_bits(1, 1);
    w.push_bits(0b01, 2);
    w.push_bits(0, 7);

    let stream = w.finish();

    // The structural filter requires the low three bits 0b100, and the
    // stream must round-trip through a real decoder.
    assert_eq!(stream[0] & 0b111, 0b100);
    let mut decoded = Vec::new();
    flate2::read::DeflateDecoder::new(&stream[..])
        .read_to_end(&mut decoded)
        .expect("hand-assembled stream must inflate");
    assert_eq!(decoded, b"A");

    stream
}

/// Embeds `payload` starting `bit_offset` bits into a fresh byte sequence,
/// zero-padding both ends.
fn shift_bits(payload: &[u8], bit_offset: usize) -> Vec<u8> {
    let total_bits = bit_offset + payload.len() * 8;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    for t in 0..payload.len() * 8 {
        let bit = (payload[t / 8] >> (t % 8)) & 1;
        let j = bit_offset + t;
        out[j / 8] |= bit << (j % 8);
    }
    out
}

fn png_chunk(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    encode_chunk(&Chunk {
        kind: *kind,
        body: body.to_vec(),
    })
}

/// A minimal well-formed PNG followed by arbitrary trailing bytes.
fn png_with_trailing(trailing: &[u8]) -> Vec<u8> {
    let mut png = PNG_SIGNATURE.to_vec();
    png.extend_from_slice(&png_chunk(b"IHDR", &[0u8; 13]));
    png.extend_from_slice(&png_chunk(b"IDAT", &[9, 9, 9]));
    png.extend_from_slice(&png_chunk(b"IEND", &[]));
    png.extend_from_slice(trailing);
    png
}

/// Trailing bytes shaped like a leftover chunk stream: 12 boundary bytes, a
/// partial chunk body, its closing CRC, then well-formed IDAT/IEND chunks.
fn leftover_trailing(partial_head: &[u8], idat_bodies: &[&[u8]]) -> Vec<u8> {
    // The detector keys off the first IDAT marker after the boundary skip;
    // the partial head must not fake one earlier.
    assert!(partial_head.windows(4).all(|w| w != b"IDAT"));
    let mut trailing = vec![0u8; 12];
    trailing.extend_from_slice(partial_head);
    trailing.extend_from_slice(&[0u8; 4]); // partial chunk's CRC, never checked
    for body in idat_bodies {
        trailing.extend_from_slice(&png_chunk(b"IDAT", body));
    }
    trailing.extend_from_slice(&png_chunk(b"IEND", &[]));
    trailing
}

/// A vulnerable PNG whose leftover payload hides `stream` at `bit_offset`.
fn vulnerable_png(stream: &[u8], bit_offset: usize) -> Vec<u8> {
    let mut payload = shift_bits(stream, bit_offset);
    payload.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // adler-32 trailer
    let (head, tail) = payload.split_at(payload.len() / 2);
    png_with_trailing(&leftover_trailing(head, &[tail]))
}

#[test]
fn non_png_bytes_scan_as_none() {
    let scanner = Scanner::new();
    assert_eq!(
        scanner.scan(b"GIF89a not a png at all", ScanConfidence::Certain),
        ScanConfidence::None
    );
    assert_eq!(scanner.scan(b"", ScanConfidence::Certain), ScanConfidence::None);
    assert_eq!(scanner.scan(b"\x89PN", ScanConfidence::Certain), ScanConfidence::None);
}

#[test]
fn clean_png_scans_as_none() {
    let scanner = Scanner::new();
    let png = png_with_trailing(&[]);
    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::None);
}

#[test]
fn corrupt_visible_stream_scans_as_error() {
    let scanner = Scanner::new();
    let mut png = png_with_trailing(&[]);
    let len = png.len();
    png[len - 1] ^= 0xFF; // break the IEND CRC
    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::Error);
}

#[test]
fn trailing_garbage_scans_as_low() {
    let scanner = Scanner::new();
    let png = png_with_trailing(&[0xAB; 64]);
    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::Low);
}

#[test]
fn short_trailing_garbage_scans_as_low() {
    let scanner = Scanner::new();
    let png = png_with_trailing(&[0x01, 0x02, 0x03]);
    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::Low);
}

#[test]
fn garbled_leftover_chunks_scan_as_medium() {
    let scanner = Scanner::new();
    // A marker with a parseable-looking header but a wrong checksum.
    let mut trailing = vec![0u8; 12];
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(b"IDAT");
    trailing.extend_from_slice(&[0x55; 16]);
    let png = png_with_trailing(&trailing);
    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::Medium);
}

#[test]
fn marker_too_close_to_boundary_scans_as_medium() {
    let scanner = Scanner::new();
    // "IDAT" within the first 8 searched bytes leaves no room for a chunk
    // header before it.
    let mut trailing = vec![0u8; 12];
    trailing.extend_from_slice(b"IDAT");
    trailing.extend_from_slice(&[0u8; 24]);
    let png = png_with_trailing(&trailing);
    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::Medium);
}

#[test]
fn undecodable_leftover_payload_scans_as_high() {
    let scanner = Scanner::new();
    // Structurally valid leftover chunks whose payload never passes the
    // block-header filter (0xAA has low bits 010).
    let png = png_with_trailing(&leftover_trailing(&[0xAA; 40], &[&[0xAA; 40]]));
    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::High);
}

#[test]
fn recoverable_payload_scans_as_certain_at_every_bit_offset() {
    let stream = dynamic_first_deflate_stream();
    for bit_offset in 0..8 {
        let scanner = Scanner::new();
        let png = vulnerable_png(&stream, bit_offset);
        assert_eq!(
            scanner.scan(&png, ScanConfidence::Certain),
            ScanConfidence::Certain,
            "offset {bit_offset} must be recoverable"
        );
    }
}

#[test]
fn leftover_payload_spans_multiple_idat_chunks() {
    let stream = dynamic_first_deflate_stream();
    let mut payload = shift_bits(&stream, 0);
    payload.extend_from_slice(&[0, 0, 0, 0]);
    // Split across the partial head and two separate IDAT bodies.
    let third = payload.len() / 3;
    let png = png_with_trailing(&leftover_trailing(
        &payload[..third],
        &[&payload[third..2 * third], &payload[2 * third..]],
    ));
    let scanner = Scanner::new();
    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::Certain);
}

#[test]
fn low_threshold_skips_brute_force() {
    let stream = dynamic_first_deflate_stream();
    let png = vulnerable_png(&stream, 3);

    let scanner = Scanner::new();
    assert_eq!(scanner.scan(&png, ScanConfidence::Low), ScanConfidence::Low);
    assert_eq!(scanner.realignment_runs(), 0);

    assert_eq!(scanner.scan(&png, ScanConfidence::Medium), ScanConfidence::Medium);
    assert_eq!(scanner.realignment_runs(), 0);

    assert_eq!(scanner.scan(&png, ScanConfidence::High), ScanConfidence::High);
    assert_eq!(scanner.realignment_runs(), 0);

    assert_eq!(scanner.scan(&png, ScanConfidence::Certain), ScanConfidence::Certain);
    assert_eq!(scanner.realignment_runs(), 1);
}

#[test]
fn threshold_low_still_reports_none_for_clean_png() {
    let scanner = Scanner::new();
    let png = png_with_trailing(&[]);
    assert_eq!(scanner.scan(&png, ScanConfidence::Low), ScanConfidence::None);
}
