//! Per-file symmetric keys
//!
//! Every encrypted upload gets a fresh 256-bit key. The key is zeroed when
//! dropped and travels inside the manifest as a hex string.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use super::encryption::EncryptionError;

/// AES-256 key length in bytes
pub const KEY_LENGTH: usize = 32;

/// Per-file encryption key
/// Automatically zeroed when dropped
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_LENGTH],
}

impl EncryptionKey {
    /// Generate a new random key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Build a key from raw bytes, rejecting anything but 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EncryptionError> {
        let key: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| EncryptionError::InvalidKeyLength {
                    expected: KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self { key })
    }

    /// Parse the hex form embedded in manifests
    pub fn from_hex(s: &str) -> Result<Self, EncryptionError> {
        let bytes = hex::decode(s).map_err(|_| EncryptionError::InvalidKeyEncoding)?;
        Self::from_slice(&bytes)
    }

    /// Hex form for embedding in manifests
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Get raw key bytes (use carefully)
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Generate a fresh random per-file key
pub fn generate_encryption_key() -> EncryptionKey {
    EncryptionKey::generate()
}
