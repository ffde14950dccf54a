//! Encryption at rest for local queue logs.
//!
//! Provides AES-256-GCM authenticated encryption for queue records.
//! Encryption is mandatory: every origin's queue is encrypted with an
//! origin-scoped key, and a missing or invalid key fails all queue reads
//! with [`crate::Error::EncryptionKeyUnavailable`] rather than ever falling
//! back to plaintext.
//!
//! # Format
//!
//! - **Algorithm**: AES-256-GCM (authenticated encryption)
//! - **Key**: 32 bytes (256 bits), base64-encoded for transport
//! - **Nonce**: 12 bytes, randomly generated per record
//! - **Record**: `MEMSYNC_ENC_V1\0` magic + nonce + ciphertext + auth tag

use crate::{Error, Result};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use rand::Rng;

/// Magic bytes identifying an encrypted queue record.
pub const MAGIC_HEADER: &[u8] = b"MEMSYNC_ENC_V1\0";

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (32 bytes / 256 bits).
const KEY_SIZE: usize = 32;

/// An origin-scoped 256-bit queue key.
#[derive(Debug, Clone)]
pub struct OriginKey {
    key: [u8; KEY_SIZE],
}

impl OriginKey {
    /// Creates a key from raw bytes.
    #[must_use]
    pub const fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Creates a key from a base64-encoded string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncryptionKeyUnavailable`] if the encoding or size
    /// is invalid.
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|e| Error::EncryptionKeyUnavailable(format!("invalid base64 key: {e}")))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(Error::EncryptionKeyUnavailable(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                key_bytes.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&key_bytes);
        Ok(Self { key })
    }

    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }
}

/// AES-256-GCM encryptor for one origin's queue.
pub struct QueueEncryptor {
    cipher: Aes256Gcm,
}

impl QueueEncryptor {
    /// Creates an encryptor from an origin key.
    #[must_use]
    pub fn new(key: &OriginKey) -> Self {
        let key = Key::<Aes256Gcm>::from(key.key);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Encrypts a plaintext record.
    ///
    /// Returns: magic header + nonce + ciphertext (includes auth tag).
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext =
            self.cipher
                .encrypt(&nonce, plaintext)
                .map_err(|e| Error::OperationFailed {
                    operation: "encrypt_queue_record".to_string(),
                    cause: format!("AES-256-GCM encryption failed: {e}"),
                })?;

        let mut output = Vec::with_capacity(MAGIC_HEADER.len() + NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(MAGIC_HEADER);
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypts an encrypted record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncryptionKeyUnavailable`] if authentication fails
    /// (wrong key), or an error if the record is structurally invalid.
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        let min_size = MAGIC_HEADER.len() + NONCE_SIZE + 16; // 16 = auth tag
        if encrypted.len() < min_size {
            return Err(Error::OperationFailed {
                operation: "decrypt_queue_record".to_string(),
                cause: format!(
                    "record too short: {} bytes, minimum {min_size}",
                    encrypted.len()
                ),
            });
        }

        if !encrypted.starts_with(MAGIC_HEADER) {
            return Err(Error::OperationFailed {
                operation: "decrypt_queue_record".to_string(),
                cause: "missing magic header".to_string(),
            });
        }

        let nonce_start = MAGIC_HEADER.len();
        let nonce_end = nonce_start + NONCE_SIZE;
        let nonce_array: [u8; NONCE_SIZE] =
            encrypted[nonce_start..nonce_end]
                .try_into()
                .map_err(|_| Error::OperationFailed {
                    operation: "decrypt_queue_record".to_string(),
                    cause: "invalid nonce length".to_string(),
                })?;
        let nonce = Nonce::from(nonce_array);
        let ciphertext = &encrypted[nonce_end..];

        self.cipher.decrypt(&nonce, ciphertext).map_err(|_| {
            Error::EncryptionKeyUnavailable(
                "AES-256-GCM authentication failed (wrong key or tampered record)".to_string(),
            )
        })
    }
}
