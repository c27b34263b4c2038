//! Chunked reading of a snapshot byte stream for transfer to a follower.

use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// A cursor over a snapshot byte stream, splitting it into fixed-size chunks for transfer.
///
/// The cursor only advances when the current chunk's send has been acknowledged; a failed or
/// rejected send retries the same chunk index, re-seeking in the underlying stream as needed.
/// All length and offset arithmetic is 64-bit: snapshots of a large data tree routinely exceed
/// 32-bit sizes.
pub(crate) struct SnapshotChunker<S> {
    snapshot: Box<S>,
    total_len: u64,
    chunk_size: u64,
    chunk_index: u64,
}

impl<S: AsyncRead + AsyncSeek + Send + Unpin> SnapshotChunker<S> {
    /// Open a chunker over the given snapshot stream, measuring its total length.
    pub(crate) async fn open(mut snapshot: Box<S>, chunk_size: u64) -> std::io::Result<Self> {
        let total_len = snapshot.seek(SeekFrom::End(0)).await?;
        Ok(Self {
            snapshot,
            total_len,
            chunk_size,
            chunk_index: 0,
        })
    }

    pub(crate) fn total_len(&self) -> u64 {
        self.total_len
    }

    /// The index of the chunk the cursor currently points at.
    pub(crate) fn chunk_index(&self) -> u64 {
        self.chunk_index
    }

    pub(crate) fn total_chunks(&self) -> u64 {
        total_chunks(self.total_len, self.chunk_size)
    }

    /// True once the chunk at `chunk_index` carries the final bytes of the stream.
    pub(crate) fn is_last_chunk(&self, chunk_index: u64) -> bool {
        (chunk_index + 1).saturating_mul(self.chunk_size) >= self.total_len
    }

    /// Read the bytes of the current chunk: exactly `min(chunk_size, remaining)` bytes.
    ///
    /// The stream is re-seeked on every read, so re-reading the same chunk after a failed
    /// send requires no extra state.
    pub(crate) async fn read_current_chunk(&mut self) -> std::io::Result<Vec<u8>> {
        let offset = self.chunk_index.saturating_mul(self.chunk_size);
        self.snapshot.seek(SeekFrom::Start(offset)).await?;
        let want = std::cmp::min(self.chunk_size, self.total_len.saturating_sub(offset)) as usize;
        let mut buf = vec![0u8; want];
        if want > 0 {
            self.snapshot.read_exact(&mut buf).await?;
        }
        Ok(buf)
    }

    /// Advance to the next chunk. Must only be called once the current chunk's send has been
    /// acknowledged.
    pub(crate) fn advance(&mut self) {
        self.chunk_index += 1;
    }

    /// Restart the stream from the first chunk.
    pub(crate) fn rewind(&mut self) {
        self.chunk_index = 0;
    }
}

/// Total number of chunks needed for `total_len` bytes cut into `chunk_size` pieces:
/// `ceil(total_len / chunk_size)`.
///
/// An empty snapshot still produces one (empty) closing chunk, as the transfer protocol needs
/// a final `done` frame.
pub(crate) fn total_chunks(total_len: u64, chunk_size: u64) -> u64 {
    if total_len == 0 {
        return 1;
    }
    (total_len + chunk_size - 1) / chunk_size
}

/// The byte length of the final chunk: `total_len - chunk_size * (total_chunks - 1)`.
pub(crate) fn last_chunk_len(total_len: u64, chunk_size: u64) -> u64 {
    if total_len == 0 {
        return 0;
    }
    total_len - chunk_size * (total_chunks(total_len, chunk_size) - 1)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn chunk_arithmetic_exact_division() {
        assert_eq!(total_chunks(100, 10), 10);
        assert_eq!(last_chunk_len(100, 10), 10);
    }

    #[test]
    fn chunk_arithmetic_with_remainder() {
        assert_eq!(total_chunks(101, 10), 11);
        assert_eq!(last_chunk_len(101, 10), 1);
    }

    #[test]
    fn chunk_arithmetic_single_chunk() {
        assert_eq!(total_chunks(5, 10), 1);
        assert_eq!(last_chunk_len(5, 10), 5);
    }

    /// Lengths beyond 32-bit range must be handled exactly.
    #[test]
    fn chunk_arithmetic_64_bit_lengths() {
        let total_len: u64 = 4_294_967_294;
        let chunk_size: u64 = 9_999_991;
        let chunks = total_chunks(total_len, chunk_size);
        assert_eq!(chunks, 430);
        assert_eq!(last_chunk_len(total_len, chunk_size), total_len - chunk_size * (chunks - 1));
        assert_eq!(last_chunk_len(total_len, chunk_size), 4_971_155);
    }

    #[tokio::test]
    async fn chunks_concatenate_to_original_bytes() -> std::io::Result<()> {
        let data: Vec<u8> = (0..10_240u32).map(|i| (i % 251) as u8).collect();
        let mut chunker = SnapshotChunker::open(Box::new(Cursor::new(data.clone())), 4096).await?;
        assert_eq!(chunker.total_len(), 10_240);
        assert_eq!(chunker.total_chunks(), 3);

        let mut out = Vec::new();
        loop {
            let index = chunker.chunk_index();
            let chunk = chunker.read_current_chunk().await?;
            let done = chunker.is_last_chunk(index);
            if done {
                assert_eq!(chunk.len() as u64, last_chunk_len(10_240, 4096));
            } else {
                assert_eq!(chunk.len(), 4096);
            }
            out.extend_from_slice(&chunk);
            if done {
                break;
            }
            chunker.advance();
        }
        assert_eq!(out, data);
        Ok(())
    }

    #[tokio::test]
    async fn failed_send_rereads_the_same_chunk() -> std::io::Result<()> {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut chunker = SnapshotChunker::open(Box::new(Cursor::new(data)), 256).await?;
        let first = chunker.read_current_chunk().await?;
        // No advance: simulates an unacknowledged send.
        let again = chunker.read_current_chunk().await?;
        assert_eq!(first, again);
        Ok(())
    }

    #[tokio::test]
    async fn empty_snapshot_sends_one_closing_chunk() -> std::io::Result<()> {
        let mut chunker = SnapshotChunker::open(Box::new(Cursor::new(Vec::<u8>::new())), 256).await?;
        assert_eq!(chunker.total_chunks(), 1);
        assert!(chunker.is_last_chunk(0));
        let chunk = chunker.read_current_chunk().await?;
        assert!(chunk.is_empty());
        Ok(())
    }
}
