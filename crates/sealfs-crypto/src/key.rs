//! Key and chunk-size validation

use aes_gcm::{aead::KeyInit, Aes256Gcm};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::format::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::KEY_SIZE;

/// A 256-bit AES key owned by one encrypted store. Zeroized on drop.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Copy a caller-supplied key. The caller may clear its buffer afterwards.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey { len: bytes.len() })?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Build the AEAD primitive for one operation.
    pub(crate) fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.bytes).into())
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Check a configured chunk size against the container bounds.
pub fn validate_chunk_size(size: u32) -> CryptoResult<u32> {
    if size < MIN_CHUNK_SIZE {
        return Err(CryptoError::ChunkSizeTooSmall {
            size,
            min: MIN_CHUNK_SIZE,
        });
    }
    if size > MAX_CHUNK_SIZE {
        return Err(CryptoError::ChunkSizeTooLarge {
            size,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok(size)
}
