//! PNG chunk reader
//!
//! Parses the chunked container format: 4-byte big-endian length, 4-byte
//! type tag, body, 4-byte CRC32 over type + body. Validation only; recovery
//! policy belongs to the caller.

use std::io::{self, Read};

/// The fixed 8-byte PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Compressed image-data chunk tag.
pub const IDAT: [u8; 4] = *b"IDAT";

/// End-of-image chunk tag.
pub const IEND: [u8; 4] = *b"IEND";

/// Chunk parse error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The stream ended before a complete chunk could be read.
    #[error("truncated chunk stream")]
    Truncated,

    /// The stored CRC32 does not match the checksum of type + body.
    #[error("crc32 mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Integrity { stored: u32, computed: u32 },

    /// An underlying read failed.
    #[error("chunk read failed: {0}")]
    Io(#[from] io::Error),
}

/// A single parsed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 4-byte type tag.
    pub kind: [u8; 4],
    /// Chunk body, exactly the declared length.
    pub body: Vec<u8>,
}

impl Chunk {
    /// Whether this chunk delimits the end of the visible image.
    #[inline]
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.kind == IEND
    }
}

/// Reads one chunk, consuming exactly `8 + length + 4` bytes.
///
/// # Errors
/// - `ChunkError::Truncated` if the stream ends mid-chunk
/// - `ChunkError::Integrity` if the trailing CRC32 does not match
/// - `ChunkError::Io` for any other read failure
pub fn read_chunk<R: Read>(reader: &mut R) -> Result<Chunk, ChunkError> {
    let length = read_u32(reader)? as usize;
    let kind = read_array::<4, R>(reader)?;

    // Read through a bounded adapter so a hostile declared length cannot
    // force a giant up-front allocation.
    let mut body = Vec::new();
    reader
        .take(length as u64)
        .read_to_end(&mut body)
        .map_err(ChunkError::Io)?;
    if body.len() != length {
        return Err(ChunkError::Truncated);
    }

    let stored = read_u32(reader)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&kind);
    hasher.update(&body);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(ChunkError::Integrity { stored, computed });
    }

    Ok(Chunk { kind, body })
}

/// Serializes a chunk back into its wire form.
#[must_use]
pub fn encode_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + chunk.body.len());
    out.extend_from_slice(&(chunk.body.len() as u32).to_be_bytes());
    out.extend_from_slice(&chunk.kind);
    out.extend_from_slice(&chunk.body);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&chunk.kind);
    hasher.update(&chunk.body);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
    out
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ChunkError> {
    Ok(u32::from_be_bytes(read_array::<4, R>(reader)?))
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N], ChunkError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ChunkError::Truncated
        } else {
            ChunkError::Io(e)
        }
    })?;
    Ok(buf)
}
