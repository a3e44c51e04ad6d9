//! File processing module
//!
//! Handles chunking and file manifests.

pub mod chunker;
pub mod manifest;

pub use chunker::{reassemble_chunks, split_to_chunks, Chunk, ChunkError, DEFAULT_CHUNK_SIZE};
pub use manifest::{create_file_manifest, FileManifest, ManifestChunk, ManifestSummary};
