use sealfs_storage::StorageError;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Failures of the encryption layer. None of them are retried internally.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: expected 32 bytes, got {len}")]
    InvalidKey { len: usize },

    #[error("chunk size {size} is below the minimum of {min}")]
    ChunkSizeTooSmall { size: u32, min: u32 },

    #[error("chunk size {size} exceeds the maximum of {max}")]
    ChunkSizeTooLarge { size: u32, max: u32 },

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid chunk size in container: {len} (allowed {min}..={max})")]
    InvalidChunkSize { len: u32, min: u32, max: u32 },

    #[error("encrypted object is truncated ({context})")]
    TruncatedFile { context: &'static str },

    #[error("chunk out of sequence: expected {expected}, found {found}")]
    InvalidChunkSequence { expected: u32, found: u32 },

    #[error("chunk {seq} failed authentication: wrong key or corrupted data")]
    DecryptionFailed { seq: u32 },

    #[error("chunk {seq} encryption failed")]
    EncryptionFailed { seq: u32 },

    #[error("object exceeds the maximum number of chunks")]
    SequenceExhausted,

    #[error("operation aborted")]
    Aborted,

    #[error("reader is closed")]
    Closed,

    #[error("plaintext source failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("encryption task failed: {0}")]
    Producer(String),

    #[error("reader failed earlier: {0}")]
    Poisoned(String),
}

impl CryptoError {
    /// Ciphertext could not be authenticated or was spliced.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CryptoError::DecryptionFailed { .. } | CryptoError::InvalidChunkSequence { .. }
        )
    }

    /// The stored bytes do not form a well-framed container.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            CryptoError::UnsupportedVersion(_)
                | CryptoError::InvalidChunkSize { .. }
                | CryptoError::TruncatedFile { .. }
        )
    }

    /// Recover the typed error from a [`StorageError`] produced by the
    /// encrypted layer.
    pub fn from_storage(err: &StorageError) -> Option<&CryptoError> {
        err.layer_ref::<CryptoError>()
    }

    /// Rebuild this failure for a later call on a failed reader.
    pub(crate) fn replay(&self) -> CryptoError {
        match self {
            CryptoError::UnsupportedVersion(v) => CryptoError::UnsupportedVersion(*v),
            CryptoError::InvalidChunkSize { len, min, max } => CryptoError::InvalidChunkSize {
                len: *len,
                min: *min,
                max: *max,
            },
            CryptoError::TruncatedFile { context } => CryptoError::TruncatedFile { context: *context },
            CryptoError::InvalidChunkSequence { expected, found } => {
                CryptoError::InvalidChunkSequence {
                    expected: *expected,
                    found: *found,
                }
            }
            CryptoError::DecryptionFailed { seq } => CryptoError::DecryptionFailed { seq: *seq },
            CryptoError::Aborted => CryptoError::Aborted,
            CryptoError::Closed => CryptoError::Closed,
            other => CryptoError::Poisoned(other.to_string()),
        }
    }
}

impl From<CryptoError> for StorageError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Aborted => StorageError::Aborted,
            CryptoError::Closed => StorageError::Closed,
            CryptoError::Storage(inner) => inner,
            other => StorageError::Layer(Box::new(other)),
        }
    }
}
