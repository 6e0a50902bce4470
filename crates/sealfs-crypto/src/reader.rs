//! Read path: chunk-at-a-time decryption with sequence and length checks
//!
//! The reader keeps at most one decrypted chunk in memory. A chunk's
//! plaintext is released only after its tag verifies, so tampered,
//! truncated or reordered input never yields wrong bytes. Bytes already
//! handed out from earlier chunks are not retracted when a later chunk fails.

use aes_gcm::{aead::AeadInPlace, Aes256Gcm, Nonce};
use async_trait::async_trait;
use sealfs_storage::{read_full, ObjectRead, ObjectReader, StorageResult};
use tracing::{trace, warn};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::format::{ChunkHeader, Header, CHUNK_HEADER_LEN, HEADER_LEN};
use crate::key::EncryptionKey;

enum State {
    /// Header not read yet
    Pending,
    Streaming(Header),
    /// Clean end of stream at a chunk boundary
    Finished,
    /// A read failed; later reads report the same failure
    Failed(CryptoError),
    Closed,
}

/// Plaintext view of one encrypted object
pub struct DecryptingReader {
    source: ObjectReader,
    cipher: Aes256Gcm,
    state: State,
    next_seq: Option<u32>,
    /// Decrypted, not yet consumed plaintext of the current chunk
    plain: Vec<u8>,
    pos: usize,
}

impl DecryptingReader {
    pub fn new(source: ObjectReader, key: &EncryptionKey) -> Self {
        Self {
            source,
            cipher: key.cipher(),
            state: State::Pending,
            next_seq: Some(0),
            plain: Vec::new(),
            pos: 0,
        }
    }

    /// Parsed container header, once the first read has happened.
    pub fn header(&self) -> Option<&Header> {
        match &self.state {
            State::Streaming(h) => Some(h),
            _ => None,
        }
    }

    async fn read_plain(&mut self, buf: &mut [u8]) -> CryptoResult<usize> {
        match &self.state {
            State::Closed => return Err(CryptoError::Closed),
            State::Failed(e) => return Err(e.replay()),
            State::Finished => return Ok(0),
            State::Pending | State::Streaming(_) => {}
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let header = match self.state {
            State::Streaming(h) => h,
            _ => match self.read_header().await {
                Ok(h) => {
                    self.state = State::Streaming(h);
                    h
                }
                Err(e) => return Err(self.fail(e)),
            },
        };

        while self.pos == self.plain.len() {
            match self.next_chunk(&header).await {
                Ok(true) => {}
                Ok(false) => {
                    self.state = State::Finished;
                    return Ok(0);
                }
                Err(e) => return Err(self.fail(e)),
            }
        }

        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn read_header(&mut self) -> CryptoResult<Header> {
        let mut raw = [0u8; HEADER_LEN];
        let n = read_full(&mut self.source, &mut raw).await?;
        if n < HEADER_LEN {
            return Err(CryptoError::TruncatedFile { context: "header" });
        }
        Header::decode(&raw)
    }

    /// Load and authenticate the next chunk into `plain`.
    /// Returns `false` on a clean end of stream at a chunk boundary.
    async fn next_chunk(&mut self, header: &Header) -> CryptoResult<bool> {
        let mut raw = [0u8; CHUNK_HEADER_LEN];
        let n = read_full(&mut self.source, &mut raw).await?;
        if n == 0 {
            return Ok(false);
        }
        if n < CHUNK_HEADER_LEN {
            return Err(CryptoError::TruncatedFile {
                context: "chunk header",
            });
        }

        let chunk = ChunkHeader::decode(&raw);
        chunk.validate_len(header)?;

        let expected = self.next_seq.ok_or(CryptoError::SequenceExhausted)?;
        if chunk.seq != expected {
            return Err(CryptoError::InvalidChunkSequence {
                expected,
                found: chunk.seq,
            });
        }

        self.plain.clear();
        self.plain.resize(chunk.len as usize, 0);
        self.pos = 0;
        let n = read_full(&mut self.source, &mut self.plain).await?;
        if n < chunk.len as usize {
            return Err(CryptoError::TruncatedFile {
                context: "chunk body",
            });
        }

        let nonce = header.chunk_nonce(expected);
        if self
            .cipher
            .decrypt_in_place(Nonce::from_slice(&nonce), b"", &mut self.plain)
            .is_err()
        {
            return Err(CryptoError::DecryptionFailed { seq: expected });
        }

        trace!(seq = expected, plaintext = self.plain.len(), "chunk opened");
        self.next_seq = expected.checked_add(1);
        Ok(true)
    }

    /// Drop any buffered plaintext and remember `err` for later calls.
    fn fail(&mut self, err: CryptoError) -> CryptoError {
        self.plain.zeroize();
        self.pos = 0;
        if err.is_integrity() || err.is_format() {
            warn!(error = %err, "encrypted object rejected");
        }
        self.state = State::Failed(err.replay());
        err
    }

    async fn close_source(&mut self) -> CryptoResult<()> {
        if matches!(self.state, State::Closed) {
            return Ok(());
        }
        self.state = State::Closed;
        self.plain.zeroize();
        self.pos = 0;
        self.source.close().await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectRead for DecryptingReader {
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        Ok(self.read_plain(buf).await?)
    }

    /// Idempotent; the underlying source is closed exactly once.
    async fn close(&mut self) -> StorageResult<()> {
        Ok(self.close_source().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};
    use crate::writer::ChunkEncryptor;
    use crate::TAG_SIZE;
    use proptest::prelude::*;
    use sealfs_storage::BytesReader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const CS: u32 = MIN_CHUNK_SIZE;

    fn key() -> EncryptionKey {
        EncryptionKey::from_bytes([0x5A; 32])
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8).collect()
    }

    /// Container bytes as the write path would produce them.
    fn seal(key: &EncryptionKey, chunk_size: u32, plaintext: &[u8]) -> Vec<u8> {
        let mut enc = ChunkEncryptor::new(key.cipher(), Header::generate(chunk_size));
        let mut out = enc.header().encode().to_vec();
        for part in plaintext.chunks(chunk_size as usize) {
            out.extend_from_slice(&enc.seal_frame(part).unwrap());
        }
        out
    }

    /// Byte ranges `[start, end)` of every frame after the header.
    fn frames(container: &[u8]) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut at = HEADER_LEN;
        while at < container.len() {
            let len = u32::from_be_bytes(container[at..at + 4].try_into().unwrap()) as usize;
            spans.push((at, at + CHUNK_HEADER_LEN + len));
            at += CHUNK_HEADER_LEN + len;
        }
        spans
    }

    fn reader(bytes: Vec<u8>, key: &EncryptionKey) -> DecryptingReader {
        DecryptingReader::new(Box::new(BytesReader::new(bytes)), key)
    }

    async fn decrypt_with(bytes: Vec<u8>, key: &EncryptionKey, step: usize) -> CryptoResult<Vec<u8>> {
        let mut r = reader(bytes, key);
        let mut out = Vec::new();
        let mut buf = vec![0u8; step];
        loop {
            let n = r.read_plain(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    async fn decrypt(bytes: Vec<u8>, key: &EncryptionKey) -> CryptoResult<Vec<u8>> {
        decrypt_with(bytes, key, 4096).await
    }

    #[tokio::test]
    async fn test_roundtrip_boundary_sizes() {
        let key = key();
        let cs = CS as usize;
        for len in [0, cs - 1, cs, cs + 1, 3 * cs + 500] {
            let plaintext = patterned(len);
            let out = decrypt(seal(&key, CS, &plaintext), &key).await.unwrap();
            assert_eq!(out, plaintext, "length {len}");
        }
    }

    #[tokio::test]
    async fn test_small_reads_match_bulk_read() {
        let key = key();
        let plaintext = patterned(3 * CS as usize + 77);
        let container = seal(&key, CS, &plaintext);

        let bulk = decrypt_with(container.clone(), &key, plaintext.len() + 1).await.unwrap();
        for step in [1, 7, 100, CS as usize, CS as usize + 3] {
            let pieces = decrypt_with(container.clone(), &key, step).await.unwrap();
            assert_eq!(pieces, bulk, "buffer size {step}");
        }
        assert_eq!(bulk, plaintext);
    }

    #[tokio::test]
    async fn test_empty_source_is_truncated_header() {
        let err = decrypt(Vec::new(), &key()).await.unwrap_err();
        assert!(matches!(err, CryptoError::TruncatedFile { context: "header" }));

        let err = decrypt(vec![1, 0, 0], &key()).await.unwrap_err();
        assert!(matches!(err, CryptoError::TruncatedFile { .. }));
    }

    #[tokio::test]
    async fn test_header_only_is_empty_plaintext() {
        let key = key();
        let container = seal(&key, CS, b"");
        assert_eq!(container.len(), HEADER_LEN);
        assert!(decrypt(container, &key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_single_bit_flip_is_detected() {
        let key = key();
        let container = seal(&key, DEFAULT_CHUNK_SIZE, b"Hello, World!");
        let (start, end) = frames(&container)[0];

        for byte in start + CHUNK_HEADER_LEN..end {
            for bit in 0..8 {
                let mut tampered = container.clone();
                tampered[byte] ^= 1 << bit;
                let err = decrypt(tampered, &key).await.unwrap_err();
                assert!(
                    matches!(err, CryptoError::DecryptionFailed { seq: 0 }),
                    "flip at byte {byte} bit {bit} gave {err:?}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_tampered_base_nonce_fails_authentication() {
        let key = key();
        let mut container = seal(&key, CS, &patterned(10));
        container[HEADER_LEN - 6] ^= 0x01;
        assert!(decrypt(container, &key).await.unwrap_err().is_integrity());
    }

    #[tokio::test]
    async fn test_trailing_base_nonce_bytes_are_not_used() {
        // the sequence number replaces them in every chunk nonce
        let key = key();
        let data = patterned(3000);
        let mut container = seal(&key, CS, &data);
        container[HEADER_LEN - 1] ^= 0xFF;
        assert_eq!(decrypt(container, &key).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_wrong_key() {
        let container = seal(&key(), CS, &patterned(100));
        let other = EncryptionKey::from_bytes([0xA5; 32]);
        let err = decrypt(container, &other).await.unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed { seq: 0 }));
    }

    #[tokio::test]
    async fn test_no_plaintext_from_failing_chunk() {
        let key = key();
        let plaintext = patterned(2 * CS as usize);
        let mut container = seal(&key, CS, &plaintext);
        let (start, _) = frames(&container)[1];
        container[start + CHUNK_HEADER_LEN + 5] ^= 0xFF;

        let mut r = reader(container, &key);
        let mut buf = vec![0u8; CS as usize];
        let n = r.read_plain(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &plaintext[..CS as usize], "first chunk is intact");

        let err = r.read_plain(&mut buf).await.unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed { seq: 1 }));
        // failure is sticky
        let again = r.read_plain(&mut buf).await.unwrap_err();
        assert!(matches!(again, CryptoError::DecryptionFailed { seq: 1 }));
    }

    #[tokio::test]
    async fn test_swapped_chunks_rejected() {
        let key = key();
        let container = seal(&key, CS, &patterned(3 * CS as usize));
        let spans = frames(&container);

        let mut swapped = container[..HEADER_LEN].to_vec();
        swapped.extend_from_slice(&container[spans[1].0..spans[1].1]);
        swapped.extend_from_slice(&container[spans[0].0..spans[0].1]);
        swapped.extend_from_slice(&container[spans[2].0..spans[2].1]);

        let err = decrypt(swapped, &key).await.unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidChunkSequence { expected: 0, found: 1 }
        ));
    }

    #[tokio::test]
    async fn test_dropped_and_duplicated_chunks_rejected() {
        let key = key();
        let container = seal(&key, CS, &patterned(3 * CS as usize));
        let spans = frames(&container);

        let mut dropped = container[..spans[1].0].to_vec();
        dropped.extend_from_slice(&container[spans[2].0..]);
        assert!(matches!(
            decrypt(dropped, &key).await.unwrap_err(),
            CryptoError::InvalidChunkSequence { expected: 1, found: 2 }
        ));

        let mut duplicated = container[..spans[1].1].to_vec();
        duplicated.extend_from_slice(&container[spans[1].0..]);
        assert!(matches!(
            decrypt(duplicated, &key).await.unwrap_err(),
            CryptoError::InvalidChunkSequence { expected: 2, found: 1 }
        ));
    }

    #[tokio::test]
    async fn test_forged_sequence_number_fails_authentication() {
        let key = key();
        let container = seal(&key, CS, &patterned(2 * CS as usize));
        let spans = frames(&container);

        // chunk 1 relabelled as chunk 0: passes the sequence check, fails the tag
        let mut forged = container[..HEADER_LEN].to_vec();
        let mut frame = container[spans[1].0..spans[1].1].to_vec();
        frame[4..8].copy_from_slice(&0u32.to_be_bytes());
        forged.extend_from_slice(&frame);

        assert!(matches!(
            decrypt(forged, &key).await.unwrap_err(),
            CryptoError::DecryptionFailed { seq: 0 }
        ));
    }

    #[tokio::test]
    async fn test_truncation_mid_chunk() {
        let key = key();
        let container = seal(&key, CS, &patterned(2 * CS as usize + 10));
        let spans = frames(&container);

        let cut_body = container[..spans[1].1 - 1].to_vec();
        assert!(matches!(
            decrypt(cut_body, &key).await.unwrap_err(),
            CryptoError::TruncatedFile { context: "chunk body" }
        ));

        let cut_header = container[..spans[1].0 + 3].to_vec();
        assert!(matches!(
            decrypt(cut_header, &key).await.unwrap_err(),
            CryptoError::TruncatedFile { context: "chunk header" }
        ));
    }

    #[tokio::test]
    async fn test_truncation_at_chunk_boundary_is_undetected() {
        // format v1 carries no total length or final-chunk marker
        let key = key();
        let plaintext = patterned(2 * CS as usize + 10);
        let container = seal(&key, CS, &plaintext);
        let spans = frames(&container);

        let out = decrypt(container[..spans[1].1].to_vec(), &key).await.unwrap();
        assert_eq!(out, &plaintext[..2 * CS as usize]);
    }

    #[tokio::test]
    async fn test_oversize_chunk_length_rejected() {
        let key = key();
        let mut container = seal(&key, CS, &patterned(10));
        let at = HEADER_LEN;
        container[at..at + 4].copy_from_slice(&(CS + TAG_SIZE as u32 + 1).to_be_bytes());

        assert!(matches!(
            decrypt(container, &key).await.unwrap_err(),
            CryptoError::InvalidChunkSize { .. }
        ));
    }

    #[tokio::test]
    async fn test_bad_header_rejected_before_chunks() {
        let key = key();
        let mut container = seal(&key, CS, &patterned(10));
        container[0] = 9;
        assert!(matches!(
            decrypt(container.clone(), &key).await.unwrap_err(),
            CryptoError::UnsupportedVersion(9)
        ));

        container[0] = 1;
        container[1..5].copy_from_slice(&512u32.to_be_bytes());
        assert!(matches!(
            decrypt(container, &key).await.unwrap_err(),
            CryptoError::InvalidChunkSize { len: 512, .. }
        ));
    }

    #[tokio::test]
    async fn test_chunk_size_comes_from_header() {
        let key = key();
        let plaintext = patterned(5000);
        let out = decrypt(seal(&key, 2048, &plaintext), &key).await.unwrap();
        assert_eq!(out, plaintext);
    }

    /// Counts how often the wrapped source is closed.
    struct CountingSource {
        inner: BytesReader,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ObjectRead for CountingSource {
        async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
            self.inner.read(buf).await
        }

        async fn close(&mut self) -> StorageResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let key = key();
        let closes = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            inner: BytesReader::new(seal(&key, CS, &patterned(3000))),
            closes: Arc::clone(&closes),
        };
        let mut r = DecryptingReader::new(Box::new(source), &key);

        let mut buf = [0u8; 16];
        assert_eq!(r.read_plain(&mut buf).await.unwrap(), 16);
        assert!(r.header().is_some());

        r.close().await.unwrap();
        r.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        assert!(matches!(
            r.read_plain(&mut buf).await.unwrap_err(),
            CryptoError::Closed
        ));
        let storage_err = ObjectRead::read(&mut r, &mut buf).await.unwrap_err();
        assert!(matches!(storage_err, sealfs_storage::StorageError::Closed));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_any_plaintext(
            data in proptest::collection::vec(any::<u8>(), 0..=5 * CS as usize),
            step in 1usize..=3000,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let key = key();
            let out = rt.block_on(decrypt_with(seal(&key, CS, &data), &key, step)).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
