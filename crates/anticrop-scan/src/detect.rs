//! Acropalypse detector
//!
//! Classifies a PNG's raw bytes by how confidently leftover original-image
//! data can be recovered from bytes trailing the visible image:
//! - walks the visible chunk stream to `IEND`
//! - inspects trailing bytes for leftover `IDAT` chunks
//! - reassembles the leftover compressed payload
//! - brute-forces every bit alignment with a primed raw-deflate decompressor
//!
//! The caller passes its policy threshold so the scan performs only the work
//! needed to reach a decision at that threshold.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::{Decompress, FlushDecompress, Status};

use crate::chunk::{read_chunk, ChunkError, IDAT, IEND, PNG_SIGNATURE};
use crate::confidence::ScanConfidence;

/// Size of the deflate sliding window primed ahead of each candidate.
const WINDOW_SIZE: usize = 0x8000;

/// Leading trailing-data bytes skipped before searching for a chunk marker;
/// they may be remnants of a chunk boundary from the overwritten file.
const BOUNDARY_SKIP: usize = 12;

/// Acropalypse scanner.
///
/// Stateless apart from counters; one instance is shared across all
/// concurrent crawl tasks.
#[derive(Debug, Default)]
pub struct Scanner {
    realignment_runs: AtomicU64,
}

impl Scanner {
    /// Create a new scanner.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the expensive bit-realignment phase has run.
    #[inline]
    #[must_use]
    pub fn realignment_runs(&self) -> u64 {
        self.realignment_runs.load(Ordering::Relaxed)
    }

    /// Classifies `bytes` as a potentially vulnerable PNG.
    ///
    /// Never fails: malformed input degrades to a confidence level. The
    /// `threshold` lets the scan stop as soon as the answer is decided at
    /// that policy level, skipping the more expensive later phases.
    #[must_use]
    pub fn scan(&self, bytes: &[u8], threshold: ScanConfidence) -> ScanConfidence {
        let Some(signature) = bytes.get(..PNG_SIGNATURE.len()) else {
            return ScanConfidence::None;
        };
        if signature != &PNG_SIGNATURE[..] {
            return ScanConfidence::None;
        }

        // Walk the visible image to its IEND chunk.
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(PNG_SIGNATURE.len() as u64);
        loop {
            match read_chunk(&mut cursor) {
                Ok(chunk) if chunk.is_end() => break,
                Ok(_) => {}
                Err(e) => {
                    // Likely a corrupted or partial download rather than a
                    // vulnerable image.
                    tracing::debug!(error = %e, "visible chunk stream is corrupt");
                    return ScanConfidence::Error;
                }
            }
        }

        let trailing = &bytes[cursor.position() as usize..];
        if trailing.is_empty() {
            return ScanConfidence::None;
        }
        if threshold == ScanConfidence::Low {
            return ScanConfidence::Low;
        }

        let search = trailing.get(BOUNDARY_SKIP..).unwrap_or(&[]);
        let Some(next_idat) = find(search, &IDAT) else {
            return ScanConfidence::Low;
        };
        if threshold == ScanConfidence::Medium {
            return ScanConfidence::Medium;
        }

        let Some(idat) = self.reassemble_leftover(search, trailing, next_idat) else {
            return ScanConfidence::Medium;
        };
        if threshold == ScanConfidence::High {
            return ScanConfidence::High;
        }

        self.brute_force(&idat)
    }

    /// Reassembles the leftover compressed payload: the partial chunk body
    /// preceding the discovered `IDAT` header, then every subsequent `IDAT`
    /// body, stopping at `IEND`. Returns `None` when the leftover stream is
    /// malformed or of unexpected shape.
    fn reassemble_leftover(
        &self,
        search: &[u8],
        trailing: &[u8],
        next_idat: usize,
    ) -> Option<Vec<u8>> {
        // The 4 bytes before the marker are the chunk length; the 4 before
        // those close the preceding partial chunk.
        let partial_end = next_idat.checked_sub(8)?;
        let mut idat = search[..partial_end].to_vec();

        let chunk_start = next_idat + BOUNDARY_SKIP - 4;
        let mut cursor = Cursor::new(&trailing[chunk_start..]);
        loop {
            match read_chunk(&mut cursor) {
                Ok(chunk) if chunk.kind == IDAT => idat.extend_from_slice(&chunk.body),
                Ok(chunk) if chunk.kind == IEND => break,
                Ok(chunk) => {
                    tracing::error!(kind = ?chunk.kind, "unexpected leftover chunk type");
                    return None;
                }
                Err(e @ ChunkError::Integrity { .. }) => {
                    tracing::warn!(error = %e, "leftover chunk failed checksum");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "leftover chunk stream ended early");
                    return None;
                }
            }
        }
        Some(idat)
    }

    /// Tries every bit alignment of the reassembled payload against a primed
    /// raw-deflate decompressor. First complete parse wins.
    fn brute_force(&self, idat: &[u8]) -> ScanConfidence {
        // The payload ends in a 4-byte Adler-32 trailer.
        let Some(len) = idat.len().checked_sub(4) else {
            return ScanConfidence::High;
        };
        let idat = &idat[..len];
        if idat.is_empty() {
            return ScanConfidence::High;
        }

        self.realignment_runs.fetch_add(1, Ordering::Relaxed);
        let streams = realign(idat);
        if streams[0] != idat {
            tracing::error!("bit realignment anomaly: offset-0 stream diverged from input");
            return ScanConfidence::High;
        }
        if streams[1] == idat {
            tracing::error!("bit realignment anomaly: offset-1 stream matched input");
            return ScanConfidence::High;
        }

        let prefix = priming_block();
        let mut attempt = prefix.clone();
        let mut scratch = vec![0u8; WINDOW_SIZE];
        for i in 0..idat.len() * 8 {
            let stream = &streams[i % 8];
            let Some(candidate) = stream.get(i / 8..) else {
                continue;
            };
            // Cheap structural filter: final-block-flag 0, dynamic Huffman.
            if candidate.first().map_or(true, |b| b & 0b111 != 0b100) {
                continue;
            }
            attempt.truncate(prefix.len());
            attempt.extend_from_slice(candidate);
            if inflates_completely(&attempt, &mut scratch) {
                return ScanConfidence::Certain;
            }
        }
        ScanConfidence::High
    }
}

/// Reconstructs the 8 candidate byte sequences, one per bit offset.
///
/// The input is treated as a flat least-significant-bit-first bitstream,
/// padded with 7 zero bits, and resampled starting at each offset.
fn realign(idat: &[u8]) -> [Vec<u8>; 8] {
    let data_bits = idat.len() * 8;
    let bit = |j: usize| -> u8 {
        if j < data_bits {
            (idat[j / 8] >> (j % 8)) & 1
        } else {
            0
        }
    };
    std::array::from_fn(|offset| {
        let mut out = Vec::with_capacity(idat.len());
        let mut j = offset;
        while j < data_bits {
            let mut value = 0u8;
            for k in 0..8 {
                value |= bit(j + k) << k;
            }
            out.push(value);
            j += 8;
        }
        out
    })
}

/// Builds the fixed 32 KiB priming block: a non-final stored-block header
/// followed by filler, so back-references into the unknown preceding window
/// resolve instead of failing outright.
fn priming_block() -> Vec<u8> {
    let mut block = Vec::with_capacity(5 + WINDOW_SIZE);
    block.push(0x00);
    block.extend_from_slice(&0x8000u16.to_le_bytes());
    block.extend_from_slice(&(0x8000u16 ^ 0xFFFF).to_le_bytes());
    block.resize(5 + WINDOW_SIZE, b'X');
    block
}

/// Runs a raw (headerless) inflate over `input`, discarding output.
///
/// Success means the stream ended leaving zero, or exactly one zero,
/// unconsumed input bytes.
fn inflates_completely(input: &[u8], scratch: &mut [u8]) -> bool {
    let mut decompress = Decompress::new(false);
    loop {
        let consumed = decompress.total_in() as usize;
        let produced = decompress.total_out();
        match decompress.decompress(&input[consumed..], scratch, FlushDecompress::None) {
            Ok(Status::StreamEnd) => break,
            Ok(Status::Ok | Status::BufError) => {
                if decompress.total_in() as usize == consumed
                    && decompress.total_out() == produced
                {
                    // Stalled without reaching stream end: truncated input.
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    let remaining = input.len() - decompress.total_in() as usize;
    remaining == 0 || (remaining == 1 && input[input.len() - 1] == 0x00)
}

/// Finds the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
