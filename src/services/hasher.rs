//! Streaming SHA-256 content digests.
//!
//! Reads go through a fixed 8 KiB buffer so memory use does not depend on the
//! size of the input.

use sha2::{Digest, Sha256};
use std::io::{self, SeekFrom};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Size of the read buffer used while hashing.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Hex digest of a stream together with the number of bytes it covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    /// Lowercase hex SHA-256, always 64 characters.
    pub hex: String,
    /// Bytes observed while hashing.
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("stream is larger than {limit} bytes")]
    LimitExceeded { limit: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Hash `reader` from its current position to EOF.
///
/// The reader is left exhausted; callers that need the bytes again must
/// re-open or rewind it themselves. When `limit` is set, hashing stops as soon
/// as the running total goes past it.
pub async fn digest_reader<R>(reader: &mut R, limit: Option<u64>) -> Result<ContentDigest, HashError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size: u64 = 0;

    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        size += read as u64;
        if let Some(limit) = limit {
            if size > limit {
                return Err(HashError::LimitExceeded { limit });
            }
        }
        hasher.update(&buf[..read]);
    }

    Ok(ContentDigest {
        hex: hex::encode(hasher.finalize()),
        size,
    })
}

/// Hash every byte of a seekable stream, starting from offset 0.
///
/// The read position is put back where it was before the call, including
/// when the size limit was hit, so the same handle can be uploaded right
/// afterwards.
pub async fn digest_seekable<R>(
    reader: &mut R,
    limit: Option<u64>,
) -> Result<ContentDigest, HashError>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    let original = reader.stream_position().await?;
    reader.seek(SeekFrom::Start(0)).await?;

    let digest = digest_reader(reader, limit).await;
    let restored = reader.seek(SeekFrom::Start(original)).await;

    let digest = digest?;
    restored?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Cursor,
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::ReadBuf;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    /// Yields `good` bytes, then fails.
    struct FlakyReader {
        good: usize,
    }

    impl AsyncRead for FlakyReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.good == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "peer went away",
                )));
            }
            let n = self.good.min(buf.remaining());
            buf.put_slice(&vec![b'x'; n]);
            self.good -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn known_vectors() {
        let empty = digest_reader(&mut Cursor::new(Vec::<u8>::new()), None)
            .await
            .unwrap();
        assert_eq!(empty.hex, EMPTY_SHA256);
        assert_eq!(empty.size, 0);

        let abc = digest_reader(&mut Cursor::new(b"abc".to_vec()), None)
            .await
            .unwrap();
        assert_eq!(abc.hex, ABC_SHA256);
        assert_eq!(abc.size, 3);
    }

    #[tokio::test]
    async fn hashing_is_deterministic_and_restores_position() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut cursor = Cursor::new(data.clone());

        let first = digest_seekable(&mut cursor, None).await.unwrap();
        assert_eq!(cursor.position(), 0);
        let second = digest_seekable(&mut cursor, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size, data.len() as u64);

        let mut reread = Vec::new();
        cursor.read_to_end(&mut reread).await.unwrap();
        assert_eq!(reread, data);
    }

    #[tokio::test]
    async fn seekable_hash_covers_bytes_before_the_current_offset() {
        let mut cursor = Cursor::new(b"abc".to_vec());
        cursor.set_position(2);

        let digest = digest_seekable(&mut cursor, None).await.unwrap();
        assert_eq!(digest.hex, ABC_SHA256);
        assert_eq!(cursor.position(), 2);
    }

    #[tokio::test]
    async fn limit_is_enforced_while_reading() {
        let mut cursor = Cursor::new(vec![0u8; CHUNK_SIZE * 3]);
        let err = digest_seekable(&mut cursor, Some(CHUNK_SIZE as u64))
            .await
            .unwrap_err();
        assert!(matches!(err, HashError::LimitExceeded { limit } if limit == CHUNK_SIZE as u64));
        assert_eq!(cursor.position(), 0);

        let exact = digest_reader(&mut Cursor::new(vec![1u8; 10]), Some(10))
            .await
            .unwrap();
        assert_eq!(exact.size, 10);
    }

    #[tokio::test]
    async fn io_failure_yields_no_digest() {
        let mut reader = FlakyReader { good: CHUNK_SIZE + 5 };
        let err = digest_reader(&mut reader, None).await.unwrap_err();
        match err {
            HashError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
