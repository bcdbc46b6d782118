//! Newline-delimited codec for text lines
//!
//! All messages are framed as:
//! ```text
//! [ N bytes: UTF-8 text ][ 0x0A ]
//! ```
//!
//! There is no length prefix and no escaping: a terminator embedded in the
//! text splits it into two lines on the receiving side.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Line terminator written after every outgoing line
pub const LINE_TERMINATOR: u8 = b'\n';

/// Errors that can occur during decoding
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Line too long: {length} bytes (max: {max})")]
    LineTooLong { length: usize, max: usize },
}

/// Encode a line of text followed by the terminator
pub fn encode_line(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    encode_line_into(text, &mut buf);
    buf.freeze()
}

/// Encode a line directly into a provided buffer
pub fn encode_line_into(text: &str, buf: &mut BytesMut) {
    buf.reserve(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(LINE_TERMINATOR);
}

/// Try to decode one line from the front of a buffer
///
/// Returns:
/// - `Ok(Some(line))` if a complete line was decoded (terminator removed)
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if a line exceeds `max_line_length`
pub fn decode(
    buf: &mut BytesMut,
    max_line_length: Option<usize>,
) -> Result<Option<String>, CodecError> {
    decode_from(buf, 0, max_line_length)
}

fn decode_from(
    buf: &mut BytesMut,
    scan_from: usize,
    max_line_length: Option<usize>,
) -> Result<Option<String>, CodecError> {
    let Some(offset) = buf[scan_from..].iter().position(|&b| b == LINE_TERMINATOR) else {
        check_length(buf.len(), max_line_length)?;
        return Ok(None);
    };

    let end = scan_from + offset;
    check_length(end, max_line_length)?;

    let mut line = buf.split_to(end + 1);
    line.truncate(end);
    if line.last() == Some(&b'\r') {
        line.truncate(end - 1);
    }

    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

fn check_length(length: usize, max_line_length: Option<usize>) -> Result<(), CodecError> {
    match max_line_length {
        Some(max) if length > max => Err(CodecError::LineTooLong { length, max }),
        _ => Ok(()),
    }
}

/// Decoder state for streaming line decoding
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Partial line data being accumulated
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to contain no terminator
    scanned: usize,
    max_line_length: Option<usize>,
}

impl LineDecoder {
    /// Create a decoder without a line length limit
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            scanned: 0,
            max_line_length: None,
        }
    }

    /// Create a decoder that rejects lines longer than `max` bytes
    pub fn with_max_line_length(max: Option<usize>) -> Self {
        Self {
            max_line_length: max,
            ..Self::new()
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next line from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete lines
    pub fn decode_next(&mut self) -> Result<Option<String>, CodecError> {
        let line = decode_from(&mut self.buffer, self.scanned, self.max_line_length)?;
        self.scanned = if line.is_some() { 0 } else { self.buffer.len() };
        Ok(line)
    }

    /// Flush the unterminated tail at end of stream
    ///
    /// Returns `None` if nothing is pending.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let tail = self.buffer.split();
        Some(String::from_utf8_lossy(&tail).into_owned())
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
