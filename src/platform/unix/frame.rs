//! Length-prefixed message framing over Unix stream sockets.
//!
//! Frame format: `[u32 BE: len][payload bytes of len]`
//!
//! A stream socket may split or merge writes, so every message carries its
//! length. The server side decodes and encodes incrementally to fit the
//! slot's non-blocking `try_read`/`try_write` contract; the client side uses
//! plain async reads and writes.

// ============================================================================
// Imports
// ============================================================================

use std::io::{self, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

// ============================================================================
// Constants
// ============================================================================

/// Length prefix size in bytes.
const HEADER_LEN: usize = 4;

/// Largest payload a Unix endpoint carries.
pub(crate) const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ============================================================================
// FrameReader
// ============================================================================

/// Reassembles frames from partial non-blocking reads.
#[derive(Debug, Default)]
pub(crate) struct FrameReader {
    inbound: Vec<u8>,
}

impl FrameReader {
    /// Reads the next whole frame into `out` without blocking.
    ///
    /// Returns `Ok(0)` on a clean end of stream. Bytes past the returned
    /// frame stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// - `WouldBlock` while the frame is incomplete
    /// - `InvalidData` if the frame is longer than `out`
    /// - `UnexpectedEof` if the peer closed mid-frame
    pub(crate) fn try_read(&mut self, stream: &UnixStream, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(len) = self.decode(out)? {
                return Ok(len);
            }

            self.inbound.reserve(self.missing());
            match stream.try_read_buf(&mut self.inbound)? {
                0 if self.inbound.is_empty() => return Ok(0),
                0 => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed in the middle of a message",
                    ));
                }
                _ => {}
            }
        }
    }

    /// Moves one buffered frame into `out`, if a whole one is buffered.
    fn decode(&mut self, out: &mut [u8]) -> io::Result<Option<usize>> {
        let Some(len) = self.declared_len() else {
            return Ok(None);
        };
        if len > out.len() {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("message of {len} bytes exceeds the {} byte limit", out.len()),
            ));
        }

        let end = HEADER_LEN + len;
        if self.inbound.len() < end {
            return Ok(None);
        }

        out[..len].copy_from_slice(&self.inbound[HEADER_LEN..end]);
        self.inbound.drain(..end);
        Ok(Some(len))
    }

    fn declared_len(&self) -> Option<usize> {
        self.inbound
            .first_chunk::<HEADER_LEN>()
            .map(|header| u32::from_be_bytes(*header) as usize)
    }

    /// Bytes still needed to complete the header or the current frame.
    fn missing(&self) -> usize {
        let wanted = self
            .declared_len()
            .map_or(HEADER_LEN, |len| HEADER_LEN + len);
        wanted.saturating_sub(self.inbound.len()).max(1)
    }

    /// Drops any partial frame.
    pub(crate) fn clear(&mut self) {
        self.inbound.clear();
    }
}

// ============================================================================
// FrameWriter
// ============================================================================

/// Keeps one encoded frame across partial non-blocking writes.
#[derive(Debug, Default)]
pub(crate) struct FrameWriter {
    frame: Vec<u8>,
    written: usize,
}

impl FrameWriter {
    /// Writes `payload` as one frame without blocking.
    ///
    /// A call that returns `WouldBlock` keeps the unsent tail; the next call
    /// must pass the same payload and resumes where the last one stopped.
    /// Returns `payload.len()` once the whole frame is sent.
    ///
    /// # Errors
    ///
    /// - `WouldBlock` while the frame is not fully sent
    /// - `WriteZero` if the socket accepts no bytes
    pub(crate) fn try_write(&mut self, stream: &UnixStream, payload: &[u8]) -> io::Result<usize> {
        if self.frame.is_empty() {
            self.frame = encode(payload)?;
            self.written = 0;
        }

        while self.written < self.frame.len() {
            match stream.try_write(&self.frame[self.written..])? {
                0 => return Err(ErrorKind::WriteZero.into()),
                n => self.written += n,
            }
        }

        self.clear();
        Ok(payload.len())
    }

    /// Drops any partially sent frame.
    pub(crate) fn clear(&mut self) {
        self.frame.clear();
        self.written = 0;
    }
}

// ============================================================================
// Client Side
// ============================================================================

/// Writes `payload` as one frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&encode(payload)?).await
}

/// Reads one frame of at most `max` bytes.
///
/// Returns `None` if the stream ended before a new frame began.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("message of {len} bytes exceeds the {max} byte limit"),
        ));
    }

    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

fn encode(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "message length exceeds u32"))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

// ============================================================================
// Tests
// ============================================================================
