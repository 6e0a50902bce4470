//! OpenDAL-backed [`Storage`] and the operator factory

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use sealfs_core::config::{StorageBackend, StorageConfig};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    ByteSource, ObjectMeta, ObjectRead, ObjectReader, Storage, WriteOptions, WriteOutcome,
};
use crate::error::{StorageError, StorageResult};

/// Bytes moved per backend call on both the write and the read side
const BLOCK_SIZE: usize = 256 * 1024;

/// Build an OpenDAL operator for the configured backend.
///
/// S3 credentials are read from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
/// If `enforce_tls` is set, a plaintext HTTP S3 endpoint is rejected;
/// otherwise it is allowed with a warning.
pub fn build_operator(cfg: &StorageConfig) -> Result<Operator> {
    let op = match cfg.backend {
        StorageBackend::Memory => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .layer(opendal::layers::LoggingLayer::default())
            .finish(),
        StorageBackend::Fs => {
            let root = cfg.root.to_string_lossy();
            Operator::new(opendal::services::Fs::default().root(&root))
                .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        StorageBackend::S3 => {
            if cfg.endpoint.starts_with("http://") {
                if cfg.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        cfg.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %cfg.endpoint,
                    "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
                );
            }
            let access_key = std::env::var("AWS_ACCESS_KEY_ID")
                .context("S3 backend requires AWS_ACCESS_KEY_ID")?;
            let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
                .context("S3 backend requires AWS_SECRET_ACCESS_KEY")?;

            // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
            let builder = opendal::services::S3::default()
                .root(&cfg.root.to_string_lossy())
                .endpoint(&cfg.endpoint)
                .region(&cfg.region)
                .bucket(&cfg.bucket)
                .access_key_id(&access_key)
                .secret_access_key(&secret_key);

            Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .layer(
                    opendal::layers::RetryLayer::new()
                        .with_max_times(5)
                        .with_jitter(),
                )
                .finish()
        }
    };

    Ok(op)
}

/// [`Storage`] over any OpenDAL operator
#[derive(Clone, Debug)]
pub struct OpendalStorage {
    op: Operator,
}

impl OpendalStorage {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    /// A fresh process-local store.
    pub fn memory() -> StorageResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())?.finish();
        Ok(Self::new(op))
    }

    pub fn from_config(cfg: &StorageConfig) -> Result<Self> {
        Ok(Self::new(build_operator(cfg)?))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

fn backend_err(path: &str, e: opendal::Error) -> StorageError {
    if e.kind() == opendal::ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Backend(e)
    }
}

async fn abort_writer(writer: &mut opendal::Writer, path: &str) {
    if let Err(e) = writer.abort().await {
        tracing::warn!(path, error = %e, "failed to abort backend writer");
    }
}

#[async_trait]
impl Storage for OpendalStorage {
    async fn write(
        &self,
        path: &str,
        mut source: ByteSource,
        opts: &WriteOptions,
        cancel: &CancellationToken,
    ) -> StorageResult<WriteOutcome> {
        if cancel.is_cancelled() {
            return Err(StorageError::Aborted);
        }

        let mut writer = match &opts.content_type {
            Some(ct) => self.op.writer_with(path).content_type(ct).await,
            None => self.op.writer(path).await,
        }
        .map_err(|e| backend_err(path, e))?;

        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut written = 0u64;
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StorageError::Aborted),
                r = source.read(&mut buf) => r.map_err(StorageError::Io),
            };
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    abort_writer(&mut writer, path).await;
                    return Err(e);
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.write(Bytes::copy_from_slice(&buf[..n])).await {
                abort_writer(&mut writer, path).await;
                return Err(backend_err(path, e));
            }
            written += n as u64;
        }

        writer.close().await.map_err(|e| backend_err(path, e))?;
        tracing::debug!(path, bytes = written, "object written");

        Ok(WriteOutcome {
            path: path.to_string(),
            bytes_written: written,
        })
    }

    async fn read(&self, path: &str, cancel: &CancellationToken) -> StorageResult<ObjectReader> {
        if cancel.is_cancelled() {
            return Err(StorageError::Aborted);
        }
        let meta = self.op.stat(path).await.map_err(|e| backend_err(path, e))?;
        let reader = self.op.reader(path).await.map_err(|e| backend_err(path, e))?;

        Ok(Box::new(OpendalReader {
            path: path.to_string(),
            reader: Some(reader),
            offset: 0,
            len: meta.content_length(),
            block: Bytes::new(),
            pos: 0,
        }))
    }

    async fn stat(&self, path: &str) -> StorageResult<ObjectMeta> {
        let meta = self.op.stat(path).await.map_err(|e| backend_err(path, e))?;
        Ok(ObjectMeta {
            path: path.to_string(),
            size: meta.content_length(),
            content_type: meta.content_type().map(str::to_string),
        })
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.op.delete(path).await.map_err(|e| backend_err(path, e))
    }
}

/// Sequential reader issuing ranged block reads against a stat'ed length
struct OpendalReader {
    path: String,
    reader: Option<opendal::Reader>,
    offset: u64,
    len: u64,
    block: Bytes,
    pos: usize,
}

#[async_trait]
impl ObjectRead for OpendalReader {
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let reader = self.reader.as_ref().ok_or(StorageError::Closed)?;
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pos == self.block.len() {
            if self.offset >= self.len {
                return Ok(0);
            }
            let end = self.len.min(self.offset + BLOCK_SIZE as u64);
            let block = reader
                .read(self.offset..end)
                .await
                .map_err(|e| backend_err(&self.path, e))?
                .to_bytes();
            if block.is_empty() {
                // object shrank underneath us
                self.offset = self.len;
                return Ok(0);
            }
            self.offset += block.len() as u64;
            self.block = block;
            self.pos = 0;
        }

        let n = buf.len().min(self.block.len() - self.pos);
        buf[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.reader = None;
        self.block = Bytes::new();
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{read_to_end, source_from_bytes};

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31) >> 2) as u8).collect()
    }

    #[tokio::test]
    async fn test_memory_write_read_roundtrip() {
        let storage = OpendalStorage::memory().unwrap();
        let cancel = CancellationToken::new();
        let data = patterned(BLOCK_SIZE * 2 + 17);

        let outcome = storage
            .write("a/b.bin", source_from_bytes(data.clone()), &WriteOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.bytes_written, data.len() as u64);

        let mut reader = storage.read("a/b.bin", &cancel).await.unwrap();
        let back = read_to_end(&mut reader).await.unwrap();
        reader.close().await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_read_after_close_fails() {
        let storage = OpendalStorage::memory().unwrap();
        let cancel = CancellationToken::new();
        storage
            .write("x", source_from_bytes(vec![1u8; 10]), &WriteOptions::default(), &cancel)
            .await
            .unwrap();

        let mut reader = storage.read("x", &cancel).await.unwrap();
        reader.close().await.unwrap();
        let err = reader.read(&mut [0u8; 4]).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let storage = OpendalStorage::memory().unwrap();
        let err = storage
            .read("nope", &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::NotFound(p) if p == "nope"));
    }

    #[tokio::test]
    async fn test_cancelled_write_is_aborted() {
        let storage = OpendalStorage::memory().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = storage
            .write("y", source_from_bytes(vec![0u8; 8]), &WriteOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Aborted));
    }

    #[tokio::test]
    async fn test_stat_and_delete() {
        let storage = OpendalStorage::memory().unwrap();
        let cancel = CancellationToken::new();
        storage
            .write("s", source_from_bytes(vec![9u8; 33]), &WriteOptions::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(storage.stat("s").await.unwrap().size, 33);
        storage.delete("s").await.unwrap();
        assert!(matches!(
            storage.stat("s").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_fs_backend_from_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = StorageConfig {
            backend: StorageBackend::Fs,
            root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let storage = OpendalStorage::from_config(&cfg).unwrap();
        let cancel = CancellationToken::new();
        storage
            .write("dir/file", source_from_bytes(&b"on disk"[..]), &WriteOptions::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(std::fs::read(tmp.path().join("dir/file")).unwrap(), b"on disk");
    }

    #[test]
    fn test_s3_http_enforce_tls_rejected() {
        let cfg = StorageConfig {
            backend: StorageBackend::S3,
            endpoint: "http://insecure:8333".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let err = build_operator(&cfg).unwrap_err();
        assert!(
            err.to_string().contains("enforce_tls"),
            "error message should mention enforce_tls"
        );
    }
}
