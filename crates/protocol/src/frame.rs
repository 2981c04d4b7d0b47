//! Length-delimited JSON framing.
//!
//! # Wire format
//!
//! ```text
//! PER FRAME:
//!   [2 bytes BE: payload_len]
//!   [payload_len bytes: UTF-8 JSON object]
//! ```
//!
//! Frames follow each other back to back with no separator. The payload
//! limit is enforced on both sides; a peer declaring a length above it is
//! treated as corrupt rather than buffered.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Envelope;

/// Length prefix size in bytes.
pub const LEN_PREFIX: usize = 2;

/// Errors produced by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {got} bytes exceeds limit of {max}")]
    TooLarge { got: usize, max: usize },

    #[error("empty frame")]
    Empty,

    #[error("frame is not a valid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stream ended mid-frame")]
    Truncated,
}

/// Serializes one envelope into a prefixed frame.
pub fn encode_frame(envelope: &Envelope, max_len: usize) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(envelope)?;
    let cap = max_len.min(u16::MAX as usize);
    if payload.len() > cap {
        return Err(FrameError::TooLarge {
            got: payload.len(),
            max: cap,
        });
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Feed raw bytes with [`push`](Self::push) as they arrive, in whatever
/// chunks the transport delivers them, and drain complete envelopes with
/// [`try_next`](Self::try_next). Partial frames stay buffered between
/// calls.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len: max_len.min(u16::MAX as usize),
        }
    }

    /// Appends received bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True when no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Decodes the next complete frame, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed. Errors are not recoverable:
    /// the buffer contents are undefined afterwards and the connection
    /// should be closed.
    pub fn try_next(&mut self) -> Result<Option<Envelope>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let declared = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if declared == 0 {
            return Err(FrameError::Empty);
        }
        if declared > self.max_len {
            return Err(FrameError::TooLarge {
                got: declared,
                max: self.max_len,
            });
        }
        if self.buf.len() < LEN_PREFIX + declared {
            return Ok(None);
        }

        let envelope = serde_json::from_slice(&self.buf[LEN_PREFIX..LEN_PREFIX + declared])?;
        self.buf.drain(..LEN_PREFIX + declared);
        Ok(Some(envelope))
    }
}

/// Writes one envelope as a frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    max_len: usize,
) -> Result<(), FrameError> {
    let frame = encode_frame(envelope, max_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Async envelope reader over any byte stream.
pub struct FramedReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: [u8; 1024],
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_len),
            chunk: [0u8; 1024],
        }
    }

    /// Reads until one complete envelope is available.
    ///
    /// Returns `Ok(None)` on clean end of stream; end of stream inside a
    /// frame is [`FrameError::Truncated`].
    pub async fn next_frame(&mut self) -> Result<Option<Envelope>, FrameError> {
        loop {
            if let Some(envelope) = self.decoder.try_next()? {
                return Ok(Some(envelope));
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Truncated);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}
