//! Incremental CRLF Line Framer
//!
//! TCP is a stream protocol: a single read may hold half a command, or
//! several commands at once. The framer accumulates raw bytes and hands
//! back every complete CRLF-terminated line, keeping the unterminated tail
//! for the next read.
//!
//! ## How the Framer Works
//!
//! 1. Append incoming network data with `push()`
//! 2. Every complete line (CRLF included) is returned in receipt order
//! 3. Any trailing partial line stays buffered
//! 4. If the buffer would grow past the configured maximum, `push()`
//!    returns [`FrameError::BufferOverflow`] instead of appending
//!
//! Once an overflow has been reported the framer is poisoned: later calls
//! return no lines and no further errors.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Bytes requested from the socket per read
pub const READ_CHUNK_SIZE: usize = 1024;

/// Default maximum size of the partial-line buffer
pub const DEFAULT_MAX_BUFFER_LENGTH: i64 = 2_048_000;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors that can occur while framing lines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The client sent more unterminated data than the limit allows
    #[error("Maximum buffer length exceeded")]
    BufferOverflow { size: usize, max: usize },
}

/// Result type for framing operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Accumulates bytes and extracts CRLF-delimited lines.
///
/// # Example
///
/// ```
/// use hogimap::protocol::LineFramer;
///
/// let mut framer = LineFramer::new(-1);
/// assert!(framer.push(b"A1 NO").unwrap().is_empty());
///
/// let lines = framer.push(b"OP\r\n").unwrap();
/// assert_eq!(lines, vec![&b"A1 NOOP\r\n"[..]]);
/// ```
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    /// `None` means unlimited
    max_length: Option<usize>,
    /// Bytes already searched for a terminator
    scanned: usize,
    overflowed: bool,
}

impl LineFramer {
    /// Creates a framer. A negative `max_buffer_length` disables the limit.
    pub fn new(max_buffer_length: i64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            max_length: usize::try_from(max_buffer_length).ok(),
            scanned: 0,
            overflowed: false,
        }
    }

    /// Appends a chunk and returns all complete lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> FrameResult<Vec<Bytes>> {
        if self.overflowed {
            return Ok(Vec::new());
        }

        if let Some(max) = self.max_length {
            let size = self.buffer.len() + chunk.len();
            if size > max {
                self.overflowed = true;
                return Err(FrameError::BufferOverflow { size, max });
            }
        }

        self.buffer.extend_from_slice(chunk);
        Ok(self.drain_lines())
    }

    fn drain_lines(&mut self) -> Vec<Bytes> {
        let mut lines = Vec::new();

        // A CR at the end of the previous scan may pair with an LF in this chunk
        let mut start = self.scanned.saturating_sub(1);
        while let Some(pos) = find_crlf(&self.buffer[start..]) {
            let end = start + pos + 2;
            lines.push(self.buffer.split_to(end).freeze());
            start = 0;
        }
        self.scanned = self.buffer.len();

        lines
    }

    /// Drops any buffered partial data, returning how many bytes were discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;
        dropped
    }

    /// Number of bytes waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true once a buffer overflow has been reported.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
