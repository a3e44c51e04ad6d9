//! P2P Storage - content-addressed distributed storage core
//!
//! - Files are split into fixed-size chunks identified by SHA-256
//! - Chunks are optionally encrypted per file with AES-256-GCM
//! - Chunks and file structure are linked into a Merkle-DAG of CIDs
//! - Manifests and chunk providers are registered in a DHT
//! - Replicas are discovered and solicited over broadcast topics

pub mod crypto;
pub mod files;
pub mod ipld;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use crypto::{ContentHash, EncryptionKey};
pub use files::{Chunk, FileManifest};
pub use ipld::{Cid, DagNode};
pub use network::{
    MemoryNetwork, NetworkSubstrate, NodeConfig, NodeError, StorageNode, SwarmSubstrate,
    UploadOptions, UploadResult,
};
pub use storage::{LocalStore, StorageStats};
