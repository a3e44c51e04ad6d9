//! Authenticated encryption using AES-256-GCM
//!
//! Every call draws a fresh 96-bit IV from the OS CSPRNG, so an IV is never
//! reused under one key. The 16-byte tag is kept separate from the
//! ciphertext because manifests record IV and tag per chunk.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use super::hashing::ContentHash;
use super::keys::KEY_LENGTH;
use crate::files::Chunk;

/// GCM IV length in bytes
pub const IV_LENGTH: usize = 12;
/// GCM authentication tag length in bytes
pub const AUTH_TAG_LENGTH: usize = 16;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("Encryption key is not valid hex")]
    InvalidKeyEncoding,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Authentication failed - data may be corrupted or key incorrect")]
    AuthenticationFailed,
    #[error("Invalid ciphertext format: {0}")]
    InvalidFormat(String),
}

/// Ciphertext plus the metadata needed to decrypt it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub encrypted_data: Vec<u8>,
    pub iv: [u8; IV_LENGTH],
    pub auth_tag: [u8; AUTH_TAG_LENGTH],
}

impl EncryptedPayload {
    /// Rebuild a payload from stored ciphertext and hex IV/tag (manifest form)
    pub fn from_hex_parts(
        encrypted_data: Vec<u8>,
        iv_hex: &str,
        auth_tag_hex: &str,
    ) -> Result<Self, EncryptionError> {
        let iv: [u8; IV_LENGTH] = decode_fixed(iv_hex, "iv")?;
        let auth_tag: [u8; AUTH_TAG_LENGTH] = decode_fixed(auth_tag_hex, "auth tag")?;
        Ok(Self {
            encrypted_data,
            iv,
            auth_tag,
        })
    }
}

fn decode_fixed<const N: usize>(s: &str, what: &str) -> Result<[u8; N], EncryptionError> {
    let bytes =
        hex::decode(s).map_err(|_| EncryptionError::InvalidFormat(format!("{what} is not hex")))?;
    bytes.try_into().map_err(|_| {
        EncryptionError::InvalidFormat(format!("{what} must be {N} bytes"))
    })
}

/// An encrypted chunk. `hash` is still the plaintext digest.
#[derive(Clone, Debug)]
pub struct EncryptedChunk {
    pub hash: ContentHash,
    pub encrypted_data: Vec<u8>,
    pub iv: [u8; IV_LENGTH],
    pub auth_tag: [u8; AUTH_TAG_LENGTH],
}

impl EncryptedChunk {
    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }

    pub fn auth_tag_hex(&self) -> String {
        hex::encode(self.auth_tag)
    }
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, EncryptionError> {
    if key.len() != KEY_LENGTH {
        return Err(EncryptionError::InvalidKeyLength {
            expected: KEY_LENGTH,
            actual: key.len(),
        });
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength {
        expected: KEY_LENGTH,
        actual: key.len(),
    })
}

/// Encrypt data with AES-256-GCM under a 32-byte key
pub fn encrypt_data(data: &[u8], key: &[u8]) -> Result<EncryptedPayload, EncryptionError> {
    let cipher = cipher_for(key)?;

    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);

    // aes-gcm appends the tag to the ciphertext
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), data)
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    let tag_start = sealed
        .len()
        .checked_sub(AUTH_TAG_LENGTH)
        .ok_or(EncryptionError::EncryptionFailed)?;
    let tag_bytes = sealed.split_off(tag_start);
    let auth_tag: [u8; AUTH_TAG_LENGTH] = tag_bytes
        .try_into()
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    Ok(EncryptedPayload {
        encrypted_data: sealed,
        iv,
        auth_tag,
    })
}

/// Decrypt and verify. Nothing is returned unless the tag verifies.
pub fn decrypt_data(payload: &EncryptedPayload, key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = cipher_for(key)?;

    let mut sealed = Vec::with_capacity(payload.encrypted_data.len() + AUTH_TAG_LENGTH);
    sealed.extend_from_slice(&payload.encrypted_data);
    sealed.extend_from_slice(&payload.auth_tag);

    cipher
        .decrypt(Nonce::from_slice(&payload.iv), sealed.as_slice())
        .map_err(|_| EncryptionError::AuthenticationFailed)
}

/// Encrypt a single chunk, keeping its plaintext identity
pub fn encrypt_chunk(chunk: &Chunk, key: &[u8]) -> Result<EncryptedChunk, EncryptionError> {
    let payload = encrypt_data(&chunk.data, key)?;
    Ok(EncryptedChunk {
        hash: chunk.hash,
        encrypted_data: payload.encrypted_data,
        iv: payload.iv,
        auth_tag: payload.auth_tag,
    })
}

/// Decrypt a single chunk back to its plaintext form
pub fn decrypt_chunk(encrypted: &EncryptedChunk, key: &[u8]) -> Result<Chunk, EncryptionError> {
    let payload = EncryptedPayload {
        encrypted_data: encrypted.encrypted_data.clone(),
        iv: encrypted.iv,
        auth_tag: encrypted.auth_tag,
    };
    let data = decrypt_data(&payload, key)?;
    Ok(Chunk {
        hash: encrypted.hash,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_encryption_key;
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_encryption_key();
        let plaintext = b"Hello, World!";

        let payload = encrypt_data(plaintext, key.as_bytes()).unwrap();
        assert_eq!(payload.encrypted_data.len(), plaintext.len());

        let decrypted = decrypt_data(&payload, key.as_bytes()).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_encryption_key();
        let key2 = generate_encryption_key();

        let payload = encrypt_data(b"secret", key1.as_bytes()).unwrap();
        let result = decrypt_data(&payload, key2.as_bytes());

        assert!(matches!(result, Err(EncryptionError::AuthenticationFailed)));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = generate_encryption_key();
        let mut payload = encrypt_data(b"secret data", key.as_bytes()).unwrap();
        payload.auth_tag[0] ^= 0x01;

        let result = decrypt_data(&payload, key.as_bytes());
        assert!(matches!(result, Err(EncryptionError::AuthenticationFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_encryption_key();
        let mut payload = encrypt_data(b"secret data", key.as_bytes()).unwrap();
        payload.encrypted_data[3] ^= 0x80;

        let result = decrypt_data(&payload, key.as_bytes());
        assert!(matches!(result, Err(EncryptionError::AuthenticationFailed)));
    }

    #[test]
    fn test_short_key_rejected() {
        let result = encrypt_data(b"data", &[0u8; 31]);
        assert!(matches!(
            result,
            Err(EncryptionError::InvalidKeyLength {
                expected: 32,
                actual: 31
            })
        ));

        let key = generate_encryption_key();
        let payload = encrypt_data(b"data", key.as_bytes()).unwrap();
        assert!(matches!(
            decrypt_data(&payload, &[0u8; 64]),
            Err(EncryptionError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = generate_encryption_key();
        let a = encrypt_data(b"same input", key.as_bytes()).unwrap();
        let b = encrypt_data(b"same input", key.as_bytes()).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted_data, b.encrypted_data);
    }

    #[test]
    fn test_chunk_roundtrip_preserves_hash() {
        let key = generate_encryption_key();
        let chunk = Chunk::new(b"chunk payload".to_vec());

        let encrypted = encrypt_chunk(&chunk, key.as_bytes()).unwrap();
        assert_eq!(encrypted.hash, chunk.hash);
        assert_ne!(encrypted.encrypted_data, chunk.data);

        let decrypted = decrypt_chunk(&encrypted, key.as_bytes()).unwrap();
        assert_eq!(decrypted.hash, chunk.hash);
        assert_eq!(decrypted.data, chunk.data);
    }

    #[test]
    fn test_payload_from_hex_parts() {
        let key = generate_encryption_key();
        let chunk = Chunk::new(b"manifest form".to_vec());
        let encrypted = encrypt_chunk(&chunk, key.as_bytes()).unwrap();

        let payload = EncryptedPayload::from_hex_parts(
            encrypted.encrypted_data.clone(),
            &encrypted.iv_hex(),
            &encrypted.auth_tag_hex(),
        )
        .unwrap();
        assert_eq!(decrypt_data(&payload, key.as_bytes()).unwrap(), chunk.data);

        assert!(matches!(
            EncryptedPayload::from_hex_parts(vec![], "00", &encrypted.auth_tag_hex()),
            Err(EncryptionError::InvalidFormat(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let key = generate_encryption_key();
            let payload = encrypt_data(&data, key.as_bytes()).unwrap();
            prop_assert_eq!(decrypt_data(&payload, key.as_bytes()).unwrap(), data);
        }
    }
}
