//! File manifest - how a file maps onto an ordered list of chunks
//!
//! The manifest tracks:
//! - Original filename and size
//! - Chunk hashes, sizes and CIDs in reassembly order
//! - Per-chunk IV and auth tag for chunks stored encrypted
//! - The per-file key (hex), embedded in clear when encrypted
//! - A per-chunk key for deduplicated chunks sealed by an earlier upload
//!
//! The manifest is itself content-addressed: its `id` is the SHA-256 of its
//! JSON form with `id` absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::chunker::{split_to_chunks, Chunk, ChunkError};
use crate::crypto::ContentHash;
use crate::ipld::Cid;

/// Metadata for a single stored file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifest {
    /// Content hash of the manifest, assigned at store time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ContentHash>,

    pub file_name: String,

    /// Sum of plaintext chunk sizes
    pub size: u64,

    pub created: DateTime<Utc>,

    pub chunk_size: usize,

    /// Chunks in reassembly order
    pub chunks: Vec<ManifestChunk>,

    #[serde(default)]
    pub encrypted: bool,

    /// Hex AES-256 key, present iff `encrypted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

/// Information about a single chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestChunk {
    /// Plaintext SHA-256
    pub hash: ContentHash,

    /// Plaintext size
    pub size: u64,

    /// CID over the stored bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_tag: Option<String>,

    /// Hex key the stored blob was sealed under, when not the file key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

impl ManifestChunk {
    /// Whether the stored blob is ciphertext
    pub fn is_sealed(&self) -> bool {
        self.iv.is_some() || self.auth_tag.is_some()
    }
}

/// Short description of a manifest, as answered to file requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    pub file_name: String,
    pub size: u64,
    pub chunks: usize,
    pub encrypted: bool,
}

impl FileManifest {
    /// Build an unencrypted manifest over already-split chunks
    pub fn from_chunks(
        file_name: impl Into<String>,
        chunk_size: usize,
        chunks: &[Chunk],
        created: DateTime<Utc>,
    ) -> Self {
        let entries: Vec<ManifestChunk> = chunks
            .iter()
            .map(|chunk| ManifestChunk {
                hash: chunk.hash,
                size: chunk.len() as u64,
                cid: None,
                iv: None,
                auth_tag: None,
                encryption_key: None,
            })
            .collect();

        Self {
            id: None,
            file_name: file_name.into(),
            size: entries.iter().map(|c| c.size).sum(),
            created,
            chunk_size,
            chunks: entries,
            encrypted: false,
            encryption_key: None,
        }
    }

    /// Content hash of the manifest's JSON form, ignoring any current `id`
    pub fn compute_id(&self) -> Result<ContentHash, serde_json::Error> {
        let mut unidentified = self.clone();
        unidentified.id = None;
        let bytes = serde_json::to_vec(&unidentified)?;
        Ok(ContentHash::from_data(&bytes))
    }

    /// Serialize manifest to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize manifest from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Get total number of chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            file_name: self.file_name.clone(),
            size: self.size,
            chunks: self.chunk_count(),
            encrypted: self.encrypted,
        }
    }
}

/// Chunk `data` and wrap the `{hash, size}` list with file metadata.
///
/// Does not assign `id`; that happens when the manifest is stored.
pub fn create_file_manifest(
    data: &[u8],
    file_name: &str,
    chunk_size: usize,
    created: DateTime<Utc>,
) -> Result<FileManifest, ChunkError> {
    let chunks = split_to_chunks(data, chunk_size)?;
    Ok(FileManifest::from_chunks(file_name, chunk_size, &chunks, created))
}
