//! Cryptography module
//!
//! Provides content hashing, per-file keys and per-chunk authenticated
//! encryption.

pub mod encryption;
pub mod hashing;
pub mod keys;

pub use encryption::{
    decrypt_chunk, decrypt_data, encrypt_chunk, encrypt_data, EncryptedChunk, EncryptedPayload,
    EncryptionError, AUTH_TAG_LENGTH, IV_LENGTH,
};
pub use hashing::{sha256_hex, verify_chunk, ContentHash};
pub use keys::{generate_encryption_key, EncryptionKey, KEY_LENGTH};
