//! Broadcast protocol definitions
//!
//! Every payload is UTF-8 JSON with camelCase fields. Broadcast carries
//! discovery only; chunk bytes never travel over these topics.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::files::ManifestSummary;
use crate::ipld::Cid;

pub const FILE_ANNOUNCE_TOPIC: &str = "files/announce";
pub const FILE_REQUEST_TOPIC: &str = "files/request";
pub const FILE_RESPONSE_TOPIC: &str = "files/response";
pub const CHUNK_REQUEST_TOPIC: &str = "chunks/request";
pub const CHUNK_RESPONSE_TOPIC: &str = "chunks/response";
pub const REPLICATION_REQUEST_TOPIC: &str = "replication/request";
pub const REPLICATION_RESPONSE_TOPIC: &str = "replication/response";

/// Every topic a storage node listens on
pub const ALL_TOPICS: [&str; 7] = [
    FILE_ANNOUNCE_TOPIC,
    FILE_REQUEST_TOPIC,
    FILE_RESPONSE_TOPIC,
    CHUNK_REQUEST_TOPIC,
    CHUNK_RESPONSE_TOPIC,
    REPLICATION_REQUEST_TOPIC,
    REPLICATION_RESPONSE_TOPIC,
];

/// Announcement broadcast after an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnnouncement {
    pub action: String,
    pub file_id: String,
    pub file_name: String,
    pub provider: String,
    pub size: u64,
    pub chunks: usize,
    #[serde(rename = "rootCID")]
    pub root_cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub request_id: String,
    pub file_id: String,
    pub requester: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub request_id: String,
    pub file_id: String,
    pub provider: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub request_id: String,
    pub chunk_hash: String,
    pub requester: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub request_id: String,
    pub chunk_hash: String,
    pub provider: String,
    pub success: bool,
    /// Stored size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationRequest {
    pub request_id: String,
    pub chunk_hash: String,
    pub requester: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationResponse {
    pub request_id: String,
    pub chunk_hash: String,
    pub provider: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Value stored under `node:<peerId>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub peer_id: String,
    /// Milliseconds since the Unix epoch
    pub announced_at: i64,
    pub total_chunks: u64,
    pub total_size: u64,
    pub file_count: usize,
}

/// Encode a message for the wire
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Decode a message from the wire
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipld::create_raw_cid;
    use serde_json::Value;

    #[test]
    fn test_announcement_field_names() {
        let announcement = FileAnnouncement {
            action: "upload".to_string(),
            file_id: "abc".to_string(),
            file_name: "a.txt".to_string(),
            provider: "peer".to_string(),
            size: 3,
            chunks: 1,
            root_cid: create_raw_cid(b"root"),
        };
        let json: Value = serde_json::from_slice(&encode(&announcement).unwrap()).unwrap();
        assert_eq!(json["fileId"], "abc");
        assert_eq!(json["fileName"], "a.txt");
        assert!(json.get("rootCID").is_some());
    }

    #[test]
    fn test_not_found_response_omits_manifest() {
        let response = FileResponse {
            request_id: "r".to_string(),
            file_id: "f".to_string(),
            provider: "p".to_string(),
            success: false,
            manifest: None,
            reason: Some("File not found".to_string()),
        };
        let json: Value = serde_json::from_slice(&encode(&response).unwrap()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["reason"], "File not found");
        assert!(json.get("manifest").is_none());
    }

    #[test]
    fn test_decode_foreign_request() {
        let raw = br#"{"requestId":"x-1","chunkHash":"ab","requester":"x","timestamp":1700000000000}"#;
        let request: ReplicationRequest = decode(raw).unwrap();
        assert_eq!(request.requester, "x");
        assert_eq!(request.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<ChunkRequest>(b"not json").is_err());
    }
}
