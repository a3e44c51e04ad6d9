//! Network substrate capability
//!
//! The storage core only needs topic broadcast and a multi-valued key/value
//! lookup. `MemoryNetwork` implements this in-process; `SwarmSubstrate`
//! implements it over libp2p gossipsub + Kademlia.
//!
//! Key conventions:
//! - `chunk:<hash>` -> provider peer id
//! - `file:<fileName>` -> manifest id
//! - `manifest:<manifestId>` -> provider peer id
//! - `node:<peerId>` -> JSON node descriptor
//! - `cid:<cid>` -> JSON CID metadata

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::crypto::ContentHash;
use crate::ipld::Cid;

#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("DHT put failed: {0}")]
    DhtPut(String),
    #[error("DHT get failed: {0}")]
    DhtGet(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Network substrate has shut down")]
    Closed,
}

/// One value found under a DHT key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtRecord {
    pub value: Vec<u8>,
    /// Peer that stored or served the value
    pub from: String,
}

impl DhtRecord {
    /// Value as UTF-8 text, if it is
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Broadcast and DHT capability consumed by the storage pipelines
#[async_trait]
pub trait NetworkSubstrate: Send + Sync {
    /// Stable string form of this peer's identity
    fn local_peer_id(&self) -> String;

    /// Broadcast a payload on a topic. No delivery guarantee.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SubstrateError>;

    /// Subscribe to a topic; payloads from other peers arrive on the receiver
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, SubstrateError>;

    async fn dht_put(&self, key: &[u8], value: Vec<u8>) -> Result<(), SubstrateError>;

    /// All values currently known under `key`, unordered, possibly empty
    async fn dht_get(&self, key: &[u8]) -> Result<Vec<DhtRecord>, SubstrateError>;
}

pub fn chunk_key(hash: &ContentHash) -> Vec<u8> {
    format!("chunk:{}", hash).into_bytes()
}

pub fn file_key(file_name: &str) -> Vec<u8> {
    format!("file:{}", file_name).into_bytes()
}

pub fn manifest_key(manifest_id: &str) -> Vec<u8> {
    format!("manifest:{}", manifest_id).into_bytes()
}

pub fn node_key(peer_id: &str) -> Vec<u8> {
    format!("node:{}", peer_id).into_bytes()
}

pub fn cid_key(cid: &Cid) -> Vec<u8> {
    format!("cid:{}", cid).into_bytes()
}

/// Values under `key`, with lookup failures logged and treated as none found
pub async fn lookup_values(substrate: &dyn NetworkSubstrate, key: &[u8]) -> Vec<DhtRecord> {
    match substrate.dht_get(key).await {
        Ok(records) => records,
        Err(e) => {
            warn!("DHT lookup for {} failed: {}", String::from_utf8_lossy(key), e);
            Vec::new()
        }
    }
}

/// First value found under `key`, if any
pub async fn get_first_value(substrate: &dyn NetworkSubstrate, key: &[u8]) -> Option<DhtRecord> {
    lookup_values(substrate, key).await.into_iter().next()
}

/// Deduplicated provider ids from records whose value is a peer id
pub fn provider_set(records: &[DhtRecord]) -> BTreeSet<String> {
    records
        .iter()
        .filter_map(|r| r.value_str())
        .map(str::to_string)
        .collect()
}
