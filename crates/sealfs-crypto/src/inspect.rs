//! Keyless structural check of a stored container

use sealfs_storage::{read_full, ObjectRead};
use serde::Serialize;

use crate::error::{CryptoError, CryptoResult};
use crate::format::{ChunkHeader, Header, CHUNK_HEADER_LEN, HEADER_LEN};
use crate::TAG_SIZE;

/// What the framing of a container says about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub version: u8,
    pub chunk_size: u32,
    pub chunks: u64,
    /// Total stored bytes, header included
    pub stored_bytes: u64,
    pub plaintext_bytes: u64,
    /// Largest declared ciphertext length
    pub largest_chunk: u32,
}

/// Walk the header and chunk framing without decrypting anything.
///
/// Detects everything the reader detects except tag failures: bad version,
/// out-of-range sizes, sequence gaps and truncation.
pub async fn inspect<R: ObjectRead + ?Sized>(reader: &mut R) -> CryptoResult<ContainerSummary> {
    let mut raw = [0u8; HEADER_LEN];
    if read_full(reader, &mut raw).await? < HEADER_LEN {
        return Err(CryptoError::TruncatedFile { context: "header" });
    }
    let header = Header::decode(&raw)?;

    let mut summary = ContainerSummary {
        version: header.version,
        chunk_size: header.chunk_size,
        chunks: 0,
        stored_bytes: HEADER_LEN as u64,
        plaintext_bytes: 0,
        largest_chunk: 0,
    };
    let mut scratch = vec![0u8; header.max_sealed_len() as usize];

    loop {
        let mut raw = [0u8; CHUNK_HEADER_LEN];
        match read_full(reader, &mut raw).await? {
            0 => return Ok(summary),
            CHUNK_HEADER_LEN => {}
            _ => {
                return Err(CryptoError::TruncatedFile {
                    context: "chunk header",
                })
            }
        }

        let chunk = ChunkHeader::decode(&raw);
        chunk.validate_len(&header)?;
        let expected = u32::try_from(summary.chunks).map_err(|_| CryptoError::SequenceExhausted)?;
        if chunk.seq != expected {
            return Err(CryptoError::InvalidChunkSequence {
                expected,
                found: chunk.seq,
            });
        }

        let body = &mut scratch[..chunk.len as usize];
        if read_full(reader, body).await? < body.len() {
            return Err(CryptoError::TruncatedFile {
                context: "chunk body",
            });
        }

        summary.chunks += 1;
        summary.stored_bytes += (CHUNK_HEADER_LEN as u32 + chunk.len) as u64;
        summary.plaintext_bytes += (chunk.len - TAG_SIZE as u32) as u64;
        summary.largest_chunk = summary.largest_chunk.max(chunk.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DEFAULT_CHUNK_SIZE;
    use crate::key::EncryptionKey;
    use crate::writer::ChunkEncryptor;
    use sealfs_storage::BytesReader;

    fn seal(plaintext: &[u8], chunk_size: u32) -> Vec<u8> {
        let key = EncryptionKey::generate();
        let mut enc = ChunkEncryptor::new(key.cipher(), Header::generate(chunk_size));
        let mut out = enc.header().encode().to_vec();
        for part in plaintext.chunks(chunk_size as usize) {
            out.extend_from_slice(&enc.seal_frame(part).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_summary_of_multi_chunk_object() {
        let cs = DEFAULT_CHUNK_SIZE;
        let container = seal(&vec![3u8; 3 * cs as usize + 500], cs);
        let stored = container.len() as u64;

        let summary = inspect(&mut BytesReader::new(container)).await.unwrap();
        assert_eq!(summary.version, 1);
        assert_eq!(summary.chunk_size, cs);
        assert_eq!(summary.chunks, 4);
        assert_eq!(summary.plaintext_bytes, 3 * cs as u64 + 500);
        assert_eq!(summary.stored_bytes, stored);
        assert_eq!(summary.largest_chunk, cs + 16);
    }

    #[tokio::test]
    async fn test_hello_world_layout() {
        let summary = inspect(&mut BytesReader::new(seal(b"Hello, World!", DEFAULT_CHUNK_SIZE)))
            .await
            .unwrap();
        assert_eq!(summary.stored_bytes, 54);
        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.plaintext_bytes, 13);
    }

    #[tokio::test]
    async fn test_truncated_container() {
        let mut container = seal(&[1u8; 2000], 1024);
        container.truncate(container.len() - 1);
        let err = inspect(&mut BytesReader::new(container)).await.unwrap_err();
        assert!(matches!(err, CryptoError::TruncatedFile { context: "chunk body" }));
    }

    #[tokio::test]
    async fn test_sequence_gap() {
        let mut container = seal(&[1u8; 2000], 1024);
        // relabel the second chunk
        let second = HEADER_LEN + 8 + 1024 + 16;
        container[second + 4..second + 8].copy_from_slice(&5u32.to_be_bytes());
        let err = inspect(&mut BytesReader::new(container)).await.unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidChunkSequence { expected: 1, found: 5 }
        ));
    }
}
