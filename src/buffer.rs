//! Unacknowledged-data buffering for relay sessions.
//!
//! A session keeps every byte it has written until the relay acknowledges
//! it, so the exact missing suffix can be replayed after a reconnect.

use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;

/// Default limit on unacknowledged bytes (64MB).
pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 64 * 1024 * 1024;

/// Buffer error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Buffer limit exceeded.
    #[error("buffer full")]
    BufferFull,
}

/// Result type for buffer operations.
pub type BufferResult<T> = std::result::Result<T, BufferError>;

/// A chunk of written data awaiting acknowledgement.
#[derive(Debug, Clone)]
struct PendingChunk {
    /// Starting stream offset of this chunk.
    offset: u64,
    /// Data bytes.
    data: Bytes,
}

impl PendingChunk {
    /// Returns the end offset (exclusive) of this chunk.
    fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Buffer of sent-but-unacknowledged stream data.
///
/// Chunks are appended in write order and released by cumulative ACKs.
/// The buffer also tracks how far the live connection has transmitted, so
/// that after a reconnect only the bytes the relay never received are
/// replayed, sliced to the exact acknowledged position.
#[derive(Debug)]
pub struct SendBuffer {
    /// Maximum bytes to buffer.
    max_bytes: u64,
    /// Current buffered bytes.
    buffered_bytes: u64,
    /// Next offset to assign.
    next_offset: u64,
    /// Highest acknowledged offset.
    acked_offset: u64,
    /// Next byte that still has to go out on the live connection.
    sent_offset: u64,
    /// Queue of unacknowledged chunks.
    chunks: VecDeque<PendingChunk>,
}

impl SendBuffer {
    /// Create a new SendBuffer with the specified maximum size.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            buffered_bytes: 0,
            next_offset: 0,
            acked_offset: 0,
            sent_offset: 0,
            chunks: VecDeque::new(),
        }
    }

    /// Get the next offset to be assigned.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Get the highest acknowledged offset.
    pub fn acked_offset(&self) -> u64 {
        self.acked_offset
    }

    /// Get the current buffered bytes count.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// Append data to the buffer.
    ///
    /// Returns the assigned stream offset for this data.
    pub fn push(&mut self, data: Bytes) -> BufferResult<u64> {
        if data.is_empty() {
            return Ok(self.next_offset);
        }

        let data_len = data.len() as u64;
        if self.buffered_bytes + data_len > self.max_bytes {
            return Err(BufferError::BufferFull);
        }

        let offset = self.next_offset;
        self.next_offset += data_len;
        self.buffered_bytes += data_len;
        self.chunks.push_back(PendingChunk { offset, data });

        Ok(offset)
    }

    /// Process an ACK, releasing all data up to the given offset.
    ///
    /// ACKs for already acknowledged data are ignored.
    pub fn ack(&mut self, offset: u64) {
        if offset <= self.acked_offset {
            return;
        }

        // Only fully acknowledged chunks are released; a chunk straddling
        // the ACK position stays until the rest of it is acknowledged.
        while let Some(chunk) = self.chunks.front() {
            if chunk.end_offset() <= offset {
                self.buffered_bytes -= chunk.data.len() as u64;
                self.chunks.pop_front();
            } else {
                break;
            }
        }

        self.acked_offset = offset;
        if self.sent_offset < offset {
            self.sent_offset = offset;
        }
    }

    /// Rewind the transmission position after a reconnect.
    ///
    /// The relay reports how many bytes it actually received; everything
    /// past that position has to be retransmitted on the new connection.
    pub fn rewind(&mut self, offset: u64) {
        self.sent_offset = offset.max(self.acked_offset);
    }

    /// Take all data that has not yet gone out on the live connection.
    ///
    /// Returns (offset, data) pairs in stream order, sliced so the first
    /// pair starts exactly at the transmission position. Marks everything
    /// returned as transmitted.
    pub fn take_unsent(&mut self) -> Vec<(u64, Bytes)> {
        let from = self.sent_offset;
        let mut result = Vec::new();

        for chunk in &self.chunks {
            if chunk.end_offset() <= from {
                continue;
            }

            if chunk.offset >= from {
                result.push((chunk.offset, chunk.data.clone()));
            } else {
                // Chunk straddles the transmission position; only the
                // unsent tail goes out.
                let skip = (from - chunk.offset) as usize;
                result.push((from, chunk.data.slice(skip..)));
            }
        }

        self.sent_offset = self.next_offset;
        result
    }
}
