//! Write path: an encrypting producer feeding the backend through a bounded pipe
//!
//! The backend's `write` pulls from a [`ByteSource`], so encryption runs as a
//! separate task pushing framed ciphertext into a bounded channel whose
//! receiving end is handed to the backend as that source. At most
//! [`PIPE_DEPTH`] sealed chunks are in flight at once.

use std::io;
use std::sync::Arc;

use aes_gcm::{aead::AeadInPlace, Aes256Gcm, Nonce};
use bytes::Bytes;
use sealfs_storage::{ByteSource, StorageError};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CryptoError, CryptoResult};
use crate::format::{ChunkHeader, Header, CHUNK_HEADER_LEN, HEADER_LEN};
use crate::pool::BufferPool;
use crate::TAG_SIZE;

/// Sealed frames buffered between the producer and the backend write
pub const PIPE_DEPTH: usize = 4;

type Frame = io::Result<Bytes>;

/// Carried inside the `io::Error` the producer injects into the pipe when it
/// fails, so the write path can tell the backend's echo of that failure from
/// a failure of the backend itself.
#[derive(Debug, thiserror::Error)]
#[error("encrypting producer aborted: {0}")]
pub(crate) struct ProducerAbort(String);

/// Seals plaintext chunks of one object and frames them
pub struct ChunkEncryptor {
    cipher: Aes256Gcm,
    header: Header,
    next_seq: Option<u32>,
}

impl ChunkEncryptor {
    pub fn new(cipher: Aes256Gcm, header: Header) -> Self {
        Self {
            cipher,
            header,
            next_seq: Some(0),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Seal the plaintext in `frame[CHUNK_HEADER_LEN..]` in place.
    ///
    /// The first [`CHUNK_HEADER_LEN`] bytes are reserved and get overwritten
    /// with `len | seq`; the tag is appended. With `CHUNK_HEADER_LEN +
    /// chunk_size + TAG_SIZE` bytes of capacity the frame never reallocates.
    pub fn seal_in_place(&mut self, frame: &mut Vec<u8>) -> CryptoResult<()> {
        debug_assert!(frame.len() >= CHUNK_HEADER_LEN);
        debug_assert!(frame.len() - CHUNK_HEADER_LEN <= self.header.chunk_size as usize);
        let seq = self.next_seq.ok_or(CryptoError::SequenceExhausted)?;
        let nonce = self.header.chunk_nonce(seq);

        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut frame[CHUNK_HEADER_LEN..])
            .map_err(|_| CryptoError::EncryptionFailed { seq })?;
        frame.extend_from_slice(&tag);

        let header = ChunkHeader {
            len: (frame.len() - CHUNK_HEADER_LEN) as u32,
            seq,
        };
        frame[..CHUNK_HEADER_LEN].copy_from_slice(&header.encode());

        self.next_seq = seq.checked_add(1);
        Ok(())
    }

    /// Seal one chunk into a freshly allocated frame.
    pub fn seal_frame(&mut self, plaintext: &[u8]) -> CryptoResult<Bytes> {
        let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + plaintext.len() + TAG_SIZE);
        frame.resize(CHUNK_HEADER_LEN, 0);
        frame.extend_from_slice(plaintext);
        self.seal_in_place(&mut frame)?;
        Ok(Bytes::from(frame))
    }
}

/// Counters for one encrypted object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub chunks: u64,
    pub plaintext_bytes: u64,
    pub sealed_bytes: u64,
}

/// Create the bounded handoff: the sender side for the producer and the
/// reading side for the backend.
pub(crate) fn pipe() -> (mpsc::Sender<Frame>, ByteSource) {
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    (tx, Box::new(StreamReader::new(ReceiverStream::new(rx))))
}

/// Producer task body: encrypt `source` into `tx`.
///
/// On failure (source error, seal error, cancellation) the error is also
/// pushed into the pipe so the backend sees a failed stream rather than a
/// clean end of stream, and no partial chunk is emitted. If the backend hangs
/// up first the producer stops quietly; the backend reports its own failure.
pub(crate) async fn encrypt_into_pipe(
    mut encryptor: ChunkEncryptor,
    mut source: ByteSource,
    pool: Arc<BufferPool>,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> CryptoResult<PipeStats> {
    let result = pump(&mut encryptor, &mut source, &pool, &tx, &cancel).await;
    if let Err(e) = &result {
        debug!(error = %e, "encrypting producer failed, aborting pipe");
        let abort = io::Error::new(io::ErrorKind::Other, ProducerAbort(e.to_string()));
        // a send error only means the backend already hung up
        let _ = tx.send(Err(abort)).await;
    }
    result
}

async fn pump(
    encryptor: &mut ChunkEncryptor,
    source: &mut ByteSource,
    pool: &Arc<BufferPool>,
    tx: &mpsc::Sender<Frame>,
    cancel: &CancellationToken,
) -> CryptoResult<PipeStats> {
    let mut stats = PipeStats::default();

    let header = Bytes::copy_from_slice(&encryptor.header().encode());
    if !send(tx, header, cancel).await? {
        return Ok(stats);
    }
    stats.sealed_bytes += HEADER_LEN as u64;

    let chunk_size = encryptor.header().chunk_size as usize;

    loop {
        if cancel.is_cancelled() {
            return Err(CryptoError::Aborted);
        }

        // each frame owns its pooled buffer until the backend drops it
        let mut frame = pool.checkout();
        frame.clear();
        frame.resize(CHUNK_HEADER_LEN + chunk_size, 0);
        let filled = fill(source, &mut frame[CHUNK_HEADER_LEN..], cancel).await?;
        if filled == 0 {
            break;
        }
        frame.truncate(CHUNK_HEADER_LEN + filled);

        encryptor.seal_in_place(&mut frame)?;
        let frame = Bytes::from_owner(frame);
        trace!(seq = stats.chunks, plaintext = filled, "chunk sealed");
        stats.chunks += 1;
        stats.plaintext_bytes += filled as u64;
        stats.sealed_bytes += frame.len() as u64;

        if !send(tx, frame, cancel).await? {
            debug!(chunks = stats.chunks, "backend stopped reading, producer exiting");
            return Ok(stats);
        }
        if filled < chunk_size {
            break;
        }
    }

    Ok(stats)
}

/// Read until `buf` is full or the source ends.
async fn fill(
    source: &mut ByteSource,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> CryptoResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CryptoError::Aborted),
            r = source.read(&mut buf[filled..]) => r?,
        };
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Returns `false` when the receiving side is gone.
async fn send(
    tx: &mpsc::Sender<Frame>,
    frame: Bytes,
    cancel: &CancellationToken,
) -> CryptoResult<bool> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CryptoError::Aborted),
        r = tx.send(Ok(frame)) => Ok(r.is_ok()),
    }
}

/// Whether a backend error is just the backend relaying the producer's abort.
pub(crate) fn is_producer_echo(err: &StorageError) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err
                .get_ref()
                .is_some_and(|inner| inner.is::<ProducerAbort>())
            {
                return true;
            }
        }
        current = e.source();
    }
    false
}
