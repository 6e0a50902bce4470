//! Container layout: 17-byte header followed by framed AES-256-GCM chunks
//!
//! ```text
//! header: [1 byte: version][4 bytes: chunk_size BE][12 bytes: base_nonce]
//! chunk:  [4 bytes: len BE][4 bytes: seq BE][len bytes: ciphertext || tag]
//! ```
//!
//! The header carries the chunk size, so a reader never needs to be told
//! which chunk size the writer was configured with.

use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::{NONCE_SIZE, TAG_SIZE};

/// The only container version this crate reads and writes
pub const FORMAT_VERSION: u8 = 1;

/// version (1) + chunk_size (4) + base_nonce (12)
pub const HEADER_LEN: usize = 1 + 4 + NONCE_SIZE;

/// len (4) + seq (4)
pub const CHUNK_HEADER_LEN: usize = 8;

pub const MIN_CHUNK_SIZE: u32 = 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Per-chunk bytes added on top of the plaintext
const FRAME_OVERHEAD: u64 = (CHUNK_HEADER_LEN + TAG_SIZE) as u64;

/// Per-object container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub chunk_size: u32,
    pub base_nonce: [u8; NONCE_SIZE],
}

impl Header {
    /// New header with a fresh random base nonce.
    pub fn generate(chunk_size: u32) -> Self {
        let mut base_nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut base_nonce);
        Self {
            version: FORMAT_VERSION,
            chunk_size,
            base_nonce,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1..5].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[5..].copy_from_slice(&self.base_nonce);
        out
    }

    /// Parse and validate a header. The version is checked before the chunk size.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> CryptoResult<Self> {
        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }

        let chunk_size = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(CryptoError::InvalidChunkSize {
                len: chunk_size,
                min: MIN_CHUNK_SIZE,
                max: MAX_CHUNK_SIZE,
            });
        }

        let mut base_nonce = [0u8; NONCE_SIZE];
        base_nonce.copy_from_slice(&bytes[5..]);

        Ok(Self {
            version,
            chunk_size,
            base_nonce,
        })
    }

    /// Nonce for chunk `seq`: the base nonce with its last four bytes
    /// replaced by `seq` (big-endian).
    pub fn chunk_nonce(&self, seq: u32) -> [u8; NONCE_SIZE] {
        let mut nonce = self.base_nonce;
        nonce[NONCE_SIZE - 4..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    /// Largest ciphertext length a chunk of this object may declare.
    pub fn max_sealed_len(&self) -> u32 {
        self.chunk_size + TAG_SIZE as u32
    }
}

/// Framing in front of every sealed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Ciphertext length including the tag
    pub len: u32,
    pub seq: u32,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..4].copy_from_slice(&self.len.to_be_bytes());
        out[4..].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8; CHUNK_HEADER_LEN]) -> Self {
        Self {
            len: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            seq: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Reject lengths that cannot hold a tag or exceed the header's chunk size.
    pub fn validate_len(&self, header: &Header) -> CryptoResult<()> {
        if self.len < TAG_SIZE as u32 || self.len > header.max_sealed_len() {
            return Err(CryptoError::InvalidChunkSize {
                len: self.len,
                min: TAG_SIZE as u32,
                max: header.max_sealed_len(),
            });
        }
        Ok(())
    }
}

/// Plaintext size of a well-formed container of `stored_len` bytes, or `None`
/// if no container written with `chunk_size` has that length.
pub fn plaintext_len(stored_len: u64, chunk_size: u32) -> Option<u64> {
    let body = stored_len.checked_sub(HEADER_LEN as u64)?;
    let full_frame = chunk_size as u64 + FRAME_OVERHEAD;

    let full_chunks = body / full_frame;
    let tail = body % full_frame;
    match tail {
        0 => Some(full_chunks * chunk_size as u64),
        t if t >= FRAME_OVERHEAD => Some(full_chunks * chunk_size as u64 + t - FRAME_OVERHEAD),
        _ => None,
    }
}
