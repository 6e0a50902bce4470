//! The storage contract shared by backends and layers

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::{StorageError, StorageResult};

/// Byte stream handed to [`Storage::write`]. The backend pulls from it.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Byte stream returned by [`Storage::read`].
pub type ObjectReader = Box<dyn ObjectRead>;

/// Per-write options passed through to the backend
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub content_type: Option<String>,
}

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub path: String,
    /// Bytes the backend stored (for a layer: bytes handed to the inner backend)
    pub bytes_written: u64,
}

/// Object metadata as seen through a [`Storage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    pub content_type: Option<String>,
}

/// Sequential reader over one stored object.
///
/// `read` returns `Ok(0)` only at end of stream or when `buf` is empty.
/// Callers must `close` the reader when done; dropping it releases resources
/// but skips any backend-side close handshake.
#[async_trait]
pub trait ObjectRead: Send {
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize>;

    async fn close(&mut self) -> StorageResult<()>;
}

#[async_trait]
impl ObjectRead for ObjectReader {
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        (**self).read(buf).await
    }

    async fn close(&mut self) -> StorageResult<()> {
        (**self).close().await
    }
}

/// The uniform read/write contract every backend and layer implements.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store everything `source` yields at `path`.
    ///
    /// A failure while pulling from `source`, or cancellation, must abort the
    /// write rather than commit a partial object.
    async fn write(
        &self,
        path: &str,
        source: ByteSource,
        opts: &WriteOptions,
        cancel: &CancellationToken,
    ) -> StorageResult<WriteOutcome>;

    async fn read(&self, path: &str, cancel: &CancellationToken) -> StorageResult<ObjectReader>;

    async fn stat(&self, path: &str) -> StorageResult<ObjectMeta>;

    async fn delete(&self, path: &str) -> StorageResult<()>;
}

/// Read until `buf` is full or the stream ends. Returns the number of bytes
/// read; a value below `buf.len()` means end of stream was reached.
pub async fn read_full<R: ObjectRead + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> StorageResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Drain a reader into memory. Intended for small objects and tests.
pub async fn read_to_end<R: ObjectRead + ?Sized>(reader: &mut R) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Wrap an in-memory payload as a [`ByteSource`].
pub fn source_from_bytes(data: impl Into<Bytes>) -> ByteSource {
    Box::new(std::io::Cursor::new(data.into()))
}

/// In-memory [`ObjectRead`]
#[derive(Debug)]
pub struct BytesReader {
    data: Bytes,
    pos: usize,
    closed: bool,
}

impl BytesReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            closed: false,
        }
    }
}

#[async_trait]
impl ObjectRead for BytesReader {
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.closed = true;
        Ok(())
    }
}
