//! PNG stripping
//!
//! Produces a sanitized copy of a PNG truncated immediately after its `IEND`
//! chunk, discarding exactly the exploitable trailing bytes. Archives store
//! only stripped copies, never the original bytes.

use std::io::Cursor;

use crate::chunk::{encode_chunk, read_chunk, ChunkError, PNG_SIGNATURE};

/// Strip failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum StripError {
    /// The input does not begin with the PNG signature.
    #[error("not a png file")]
    NotPng,

    /// The visible chunk stream could not be parsed through `IEND`.
    #[error("corrupt chunk stream: {0}")]
    Corrupt(#[from] ChunkError),
}

/// Returns a copy of `bytes` ending exactly at the close of the `IEND` chunk.
///
/// # Errors
/// - `StripError::NotPng` if the signature is missing
/// - `StripError::Corrupt` if the visible image cannot be parsed
pub fn strip(bytes: &[u8]) -> Result<Vec<u8>, StripError> {
    if bytes.get(..PNG_SIGNATURE.len()) != Some(&PNG_SIGNATURE[..]) {
        return Err(StripError::NotPng);
    }

    let mut out = Vec::with_capacity(bytes.len().min(1 << 20));
    out.extend_from_slice(&PNG_SIGNATURE);

    let mut cursor = Cursor::new(bytes);
    cursor.set_position(PNG_SIGNATURE.len() as u64);
    loop {
        let chunk = read_chunk(&mut cursor)?;
        out.extend_from_slice(&encode_chunk(&chunk));
        if chunk.is_end() {
            break;
        }
    }
    Ok(out)
}
