//! Content identifiers
//!
//! A CID is `[version:1][codec:2 BE][sha256:32]`, base58-encoded. CIDs are
//! opaque tokens: equality is string equality, and the only thing read back
//! out of one is its version/codec.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

pub const CID_VERSION: u8 = 1;
pub const CODEC_RAW: u16 = 0x55;
pub const CODEC_DAG_JSON: u16 = 0x0200;

const CID_BYTES: usize = 1 + 2 + 32;

#[derive(Error, Debug)]
pub enum CidError {
    #[error("Unsupported input type for CID creation: {0}")]
    UnsupportedInputType(&'static str),
    #[error("CID is not valid base58: {0}")]
    InvalidEncoding(String),
    #[error("CID must decode to 35 bytes, got {0}")]
    InvalidLength(usize),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Content codec tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    Raw,
    DagJson,
    Unknown(u16),
}

impl Codec {
    pub fn code(&self) -> u16 {
        match self {
            Codec::Raw => CODEC_RAW,
            Codec::DagJson => CODEC_DAG_JSON,
            Codec::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            CODEC_RAW => Codec::Raw,
            CODEC_DAG_JSON => Codec::DagJson,
            other => Codec::Unknown(other),
        }
    }

    /// Human-readable name; unknown codes stay readable for newer peers
    pub fn name(&self) -> String {
        match self {
            Codec::Raw => "raw".to_string(),
            Codec::DagJson => "dag-json".to_string(),
            Codec::Unknown(code) => format!("unknown({})", code),
        }
    }
}

/// Input accepted by [`create_cid`]
#[derive(Clone, Copy, Debug)]
pub enum CidInput<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
    /// A JSON object or array; forces the dag-json codec
    Structured(&'a Value),
}

impl<'a> From<&'a [u8]> for CidInput<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        CidInput::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for CidInput<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        CidInput::Bytes(bytes.as_slice())
    }
}

impl<'a> From<&'a str> for CidInput<'a> {
    fn from(text: &'a str) -> Self {
        CidInput::Text(text)
    }
}

impl<'a> From<&'a Value> for CidInput<'a> {
    fn from(value: &'a Value) -> Self {
        CidInput::Structured(value)
    }
}

/// A base58 CID string
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an existing CID string after checking it parses
    pub fn parse(s: &str) -> Result<Self, CidError> {
        parse_cid(s)?;
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.0)
    }
}

/// Decoded view of a CID
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCid {
    pub version: u8,
    pub codec: Codec,
    pub codec_name: String,
    pub digest: [u8; 32],
}

/// Field-order independent JSON: object keys sorted at every depth
pub(crate) fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical_json(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Compute the CID of some content.
///
/// Bytes pass through, text is UTF-8, structured values are canonical JSON
/// and always use the dag-json codec regardless of `codec`.
pub fn create_cid<'a>(input: impl Into<CidInput<'a>>, codec: Codec) -> Result<Cid, CidError> {
    match input.into() {
        CidInput::Bytes(bytes) => Ok(encode_cid(bytes, codec)),
        CidInput::Text(text) => Ok(encode_cid(text.as_bytes(), codec)),
        CidInput::Structured(value) => match value {
            Value::Object(_) | Value::Array(_) => {
                let bytes = serde_json::to_vec(&canonical_json(value))?;
                Ok(encode_cid(&bytes, Codec::DagJson))
            }
            Value::Null => Err(CidError::UnsupportedInputType("null")),
            Value::Bool(_) => Err(CidError::UnsupportedInputType("boolean")),
            Value::Number(_) => Err(CidError::UnsupportedInputType("number")),
            Value::String(_) => Err(CidError::UnsupportedInputType("bare JSON string")),
        },
    }
}

/// CID of raw bytes
pub fn create_raw_cid(bytes: &[u8]) -> Cid {
    encode_cid(bytes, Codec::Raw)
}

fn encode_cid(bytes: &[u8], codec: Codec) -> Cid {
    let digest = Sha256::digest(bytes);

    let mut raw = Vec::with_capacity(CID_BYTES);
    raw.push(CID_VERSION);
    raw.extend_from_slice(&codec.code().to_be_bytes());
    raw.extend_from_slice(&digest);

    Cid(bs58::encode(raw).into_string())
}

/// Decode a CID string into version, codec and digest
pub fn parse_cid(cid: &str) -> Result<ParsedCid, CidError> {
    let raw = bs58::decode(cid)
        .into_vec()
        .map_err(|e| CidError::InvalidEncoding(e.to_string()))?;

    if raw.len() != CID_BYTES {
        return Err(CidError::InvalidLength(raw.len()));
    }

    let codec = Codec::from_code(u16::from_be_bytes([raw[1], raw[2]]));
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&raw[3..]);

    Ok(ParsedCid {
        version: raw[0],
        codec,
        codec_name: codec.name(),
        digest,
    })
}

/// Exact string equality; no cross-codec digest comparison
pub fn is_cid_equal(a: &Cid, b: &Cid) -> bool {
    a.as_str() == b.as_str()
}
