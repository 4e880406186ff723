//! Reading an outbound file as a sequence of bounded chunks.
//!
//! The source never loads the whole file; each chunk is seek-read on demand
//! so memory stays flat regardless of file size. Chunk boundaries are pure
//! arithmetic: every chunk is `CHUNK_SIZE` bytes except a possibly shorter
//! final one, and a zero-byte file has no chunks at all.

use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::core::config::CHUNK_SIZE;
use crate::core::error::TransferError;

/// An open file plus its frozen total size.
///
/// The size is captured at open time and treated as the truth for the whole
/// session; a file that shrinks mid-transfer surfaces as a read error rather
/// than a silent short send.
#[derive(Debug)]
pub struct ChunkSource {
    file: File,
    total: u64,
}

impl ChunkSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let file = File::open(path.as_ref()).await?;
        let total = file.metadata().await?.len();
        Ok(Self { file, total })
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Number of chunks the file will produce.
    pub fn total_chunks(&self) -> u64 {
        self.total.div_ceil(CHUNK_SIZE as u64)
    }

    /// Read up to `max_len` bytes starting at `offset`.
    ///
    /// The final chunk is clamped to the bytes that remain; asking for an
    /// offset at or past the end is a caller bug and fails loudly.
    pub async fn read(&mut self, offset: u64, max_len: usize) -> Result<Bytes, TransferError> {
        if offset >= self.total {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "chunk offset {offset} out of range for a {} byte file",
                    self.total
                ),
            )
            .into());
        }
        let len = (max_len as u64).min(self.total - offset) as usize;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
