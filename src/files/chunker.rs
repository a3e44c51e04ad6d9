//! Fixed-size file chunking
//!
//! Splits byte streams into contiguous chunks of at most `chunk_size` bytes.
//! Chunk boundaries are positional, not content-defined: an insertion early
//! in a file shifts every later boundary.

use thiserror::Error;

use crate::crypto::ContentHash;

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Chunk size must be at least 1 byte")]
    InvalidChunkSize,
    #[error("Cannot reassemble an empty chunk list")]
    EmptyInput,
}

/// A single chunk of file data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// SHA-256 of `data`
    pub hash: ContentHash,
    /// Raw chunk data
    pub data: Vec<u8>,
}

impl Chunk {
    /// Build a chunk, hashing its bytes
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            hash: ContentHash::from_data(&data),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Split data into fixed-size chunks
///
/// Produces `ceil(len / chunk_size)` chunks; every chunk but the last is
/// exactly `chunk_size` bytes. Empty input yields no chunks.
pub fn split_to_chunks(data: &[u8], chunk_size: usize) -> Result<Vec<Chunk>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::InvalidChunkSize);
    }

    let chunks: Vec<Chunk> = data
        .chunks(chunk_size)
        .map(|slice| Chunk::new(slice.to_vec()))
        .collect();

    tracing::debug!("Split {} bytes into {} chunks", data.len(), chunks.len());
    Ok(chunks)
}

/// Reassemble chunks into original file data, in the given order
pub fn reassemble_chunks(chunks: &[Chunk]) -> Result<Vec<u8>, ChunkError> {
    if chunks.is_empty() {
        return Err(ChunkError::EmptyInput);
    }

    let total: usize = chunks.iter().map(Chunk::len).sum();
    let mut result = Vec::with_capacity(total);
    for chunk in chunks {
        result.extend_from_slice(&chunk.data);
    }

    tracing::debug!("Reassembled {} chunks into {} bytes", chunks.len(), result.len());
    Ok(result)
}
