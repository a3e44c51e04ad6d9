//! Merkle-DAG nodes
//!
//! A node is `{data, links}` plus the CID of exactly that pair. File DAGs
//! have one `file` root linking `chunk0..chunkN` leaves; each leaf links the
//! chunk's own CID under `data`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use super::cid::{create_cid, Cid, CidError, Codec};
use crate::files::FileManifest;

#[derive(Error, Debug)]
pub enum DagError {
    #[error("CID error: {0}")]
    Cid(#[from] CidError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Manifest lists {manifest} chunks but {cids} CIDs were supplied")]
    ChunkCountMismatch { manifest: usize, cids: usize },
}

/// Named links from a node to other CIDs
pub type Links = BTreeMap<String, Cid>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub data: Value,
    pub links: Links,
    pub cid: Cid,
}

impl DagNode {
    /// Recompute the CID from `{data, links}`
    pub fn compute_cid(&self) -> Result<Cid, CidError> {
        node_cid(&self.data, &self.links)
    }

    /// Whether the stored CID matches the content
    pub fn verify(&self) -> Result<bool, CidError> {
        Ok(self.compute_cid()? == self.cid)
    }
}

fn node_cid(data: &Value, links: &Links) -> Result<Cid, CidError> {
    let body = json!({ "data": data, "links": links });
    create_cid(&body, Codec::DagJson)
}

/// Build a node and compute its CID
pub fn create_node(data: Value, links: Links) -> Result<DagNode, CidError> {
    let cid = node_cid(&data, &links)?;
    Ok(DagNode { data, links, cid })
}

/// A file's root node plus its per-chunk leaves
#[derive(Clone, Debug)]
pub struct FileDag {
    pub root: DagNode,
    pub leaves: Vec<DagNode>,
}

/// Build the DAG for a file from its manifest and the CIDs of its chunks
pub fn create_file_dag(manifest: &FileManifest, chunk_cids: &[Cid]) -> Result<FileDag, DagError> {
    if manifest.chunks.len() != chunk_cids.len() {
        return Err(DagError::ChunkCountMismatch {
            manifest: manifest.chunks.len(),
            cids: chunk_cids.len(),
        });
    }

    let mut leaves = Vec::with_capacity(chunk_cids.len());
    let mut chunk_links = Links::new();

    for (index, (cid, entry)) in chunk_cids.iter().zip(&manifest.chunks).enumerate() {
        let leaf = create_node(
            json!({ "type": "chunk", "index": index, "size": entry.size }),
            Links::from([("data".to_string(), cid.clone())]),
        )?;
        chunk_links.insert(format!("chunk{}", index), leaf.cid.clone());
        leaves.push(leaf);
    }

    let root = create_node(
        json!({
            "type": "file",
            "name": manifest.file_name,
            "size": manifest.size,
            "created": manifest.created,
            "chunkCount": leaves.len(),
        }),
        chunk_links,
    )?;

    Ok(FileDag { root, leaves })
}

/// A directory node linking entry names to CIDs
pub fn create_directory_node(name: &str, entries: Links) -> Result<DagNode, CidError> {
    create_node(
        json!({ "type": "directory", "name": name, "entryCount": entries.len() }),
        entries,
    )
}

pub fn serialize_node(node: &DagNode) -> Result<String, DagError> {
    Ok(serde_json::to_string(node)?)
}

pub fn deserialize_node(json: &str) -> Result<DagNode, DagError> {
    Ok(serde_json::from_str(json)?)
}
