//! `EncryptedStorage`: the encryption layer as a drop-in [`Storage`]

use std::sync::Arc;

use async_trait::async_trait;
use sealfs_storage::{
    read_full, ByteSource, ObjectMeta, ObjectRead, ObjectReader, Storage, StorageError,
    StorageResult, WriteOptions, WriteOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CryptoError, CryptoResult};
use crate::format::{plaintext_len, Header, DEFAULT_CHUNK_SIZE, HEADER_LEN};
use crate::key::{validate_chunk_size, EncryptionKey};
use crate::pool::{BufferPool, DEFAULT_MAX_IDLE};
use crate::reader::DecryptingReader;
use crate::writer::{self, ChunkEncryptor};

/// Wraps a backend so everything written through it is stored encrypted and
/// everything read through it is authenticated and decrypted.
#[derive(Debug)]
pub struct EncryptedStorage<S> {
    inner: S,
    key: EncryptionKey,
    chunk_size: u32,
    pool: Arc<BufferPool>,
}

impl<S: Storage> EncryptedStorage<S> {
    /// Validate `key` (exactly 32 bytes, copied) and `chunk_size`
    /// (1 KiB..=16 MiB, default 64 KiB).
    pub fn new(inner: S, key: &[u8], chunk_size: Option<u32>) -> CryptoResult<Self> {
        Self::with_key(inner, EncryptionKey::from_slice(key)?, chunk_size)
    }

    pub fn with_key(inner: S, key: EncryptionKey, chunk_size: Option<u32>) -> CryptoResult<Self> {
        let chunk_size = validate_chunk_size(chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE))?;
        Ok(Self {
            inner,
            key,
            chunk_size,
            pool: BufferPool::new(chunk_size, DEFAULT_MAX_IDLE),
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Open `path` for decryption with typed errors.
    pub async fn open(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> CryptoResult<DecryptingReader> {
        if cancel.is_cancelled() {
            return Err(CryptoError::Aborted);
        }
        let source = self.inner.read(path, cancel).await?;
        debug!(path, "opened encrypted object");
        Ok(DecryptingReader::new(source, &self.key))
    }

    async fn read_header(&self, path: &str) -> CryptoResult<Header> {
        let mut source = self.inner.read(path, &CancellationToken::new()).await?;
        let mut raw = [0u8; HEADER_LEN];
        let read = read_full(&mut source, &mut raw).await;
        if let Err(e) = source.close().await {
            debug!(path, error = %e, "closing header reader failed");
        }
        if read? < HEADER_LEN {
            return Err(CryptoError::TruncatedFile { context: "header" });
        }
        Header::decode(&raw)
    }
}

#[async_trait]
impl<S: Storage> Storage for EncryptedStorage<S> {
    async fn write(
        &self,
        path: &str,
        source: ByteSource,
        opts: &WriteOptions,
        cancel: &CancellationToken,
    ) -> StorageResult<WriteOutcome> {
        if cancel.is_cancelled() {
            return Err(StorageError::Aborted);
        }

        let encryptor = ChunkEncryptor::new(self.key.cipher(), Header::generate(self.chunk_size));
        let (tx, sink) = writer::pipe();
        let producer_cancel = cancel.child_token();
        let producer = tokio::spawn(writer::encrypt_into_pipe(
            encryptor,
            source,
            Arc::clone(&self.pool),
            tx,
            producer_cancel.clone(),
        ));
        debug!(path, chunk_size = self.chunk_size, "encrypting write started");
        // a dropped write future must not leave the producer parked on its source
        let _cancel_on_drop = producer_cancel.clone().drop_guard();

        let written = self.inner.write(path, sink, opts, cancel).await;
        if written.is_err() {
            // the producer may be parked on its source; nobody reads its output anymore
            producer_cancel.cancel();
        }
        let produced = match producer.await {
            Ok(result) => result,
            Err(e) => Err(CryptoError::Producer(e.to_string())),
        };

        match (written, produced) {
            (Ok(outcome), Ok(stats)) => {
                debug!(
                    path,
                    chunks = stats.chunks,
                    plaintext = stats.plaintext_bytes,
                    stored = outcome.bytes_written,
                    "encrypted object written"
                );
                Ok(outcome)
            }
            (Ok(_), Err(e)) => {
                warn!(path, error = %e, "backend accepted an object the producer failed to finish");
                Err(e.into())
            }
            (Err(backend), Ok(_)) => {
                warn!(path, error = %backend, "backend write failed");
                Err(backend)
            }
            (Err(backend), Err(producer)) => {
                if writer::is_producer_echo(&backend) {
                    debug!(path, error = %producer, "encrypting write aborted");
                    Err(producer.into())
                } else {
                    warn!(path, error = %backend, "backend write failed");
                    Err(backend)
                }
            }
        }
    }

    async fn read(&self, path: &str, cancel: &CancellationToken) -> StorageResult<ObjectReader> {
        Ok(Box::new(self.open(path, cancel).await?))
    }

    /// Metadata with `size` reporting the plaintext length.
    async fn stat(&self, path: &str) -> StorageResult<ObjectMeta> {
        let mut meta = self.inner.stat(path).await?;
        let header = self.read_header(path).await?;
        meta.size = plaintext_len(meta.size, header.chunk_size).ok_or(
            CryptoError::TruncatedFile {
                context: "object length",
            },
        )?;
        Ok(meta)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.inner.delete(path).await
    }
}
