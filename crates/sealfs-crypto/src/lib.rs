//! sealfs-crypto: transparent streaming encryption for sealfs storage
//!
//! Any [`sealfs_storage::Storage`] can be wrapped in an [`EncryptedStorage`],
//! which is itself a `Storage`. Objects are stored in a self-describing
//! container:
//!
//! ```text
//! header: version (1) | chunk_size (4, BE) | base_nonce (12)
//! chunk*: len (4, BE) | seq (4, BE) | AES-256-GCM(plaintext) || tag (16)
//! ```
//!
//! Chunk `seq` starts at 0 and increments by one; its nonce is the base nonce
//! with the trailing four bytes replaced by `seq`. Writes run an encrypting
//! producer task feeding the backend through a bounded pipe; reads decrypt and
//! authenticate one chunk at a time before releasing any of its plaintext.

pub mod error;
pub mod format;
pub mod inspect;
pub mod key;
pub mod pool;
pub mod reader;
pub mod storage;
pub mod writer;

pub use error::{CryptoError, CryptoResult};
pub use format::{
    ChunkHeader, Header, CHUNK_HEADER_LEN, DEFAULT_CHUNK_SIZE, FORMAT_VERSION, HEADER_LEN,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use inspect::{inspect, ContainerSummary};
pub use key::{validate_chunk_size, EncryptionKey};
pub use pool::{BufferPool, PooledBuffer};
pub use reader::DecryptingReader;
pub use storage::EncryptedStorage;

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
