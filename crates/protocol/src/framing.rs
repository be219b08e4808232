//! Newline-delimited JSON framing for streamed invocation events.
//!
//! # Frame Format
//!
//! Each frame is one compact JSON document followed by a single `\n`.
//! JSON string escaping guarantees the document itself contains no raw
//! newline, so frames can be split on `\n` without a length prefix.
//!
//! The decoder is incremental: feed it transport chunks of any size and it
//! yields every complete line, keeping partial lines until the rest arrives.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Content type of an NDJSON response body.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Maximum length of a single decoded line (4 MB).
pub const MAX_LINE_SIZE: usize = 4 * 1024 * 1024;

/// Encode a value as one NDJSON line, trailing newline included.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Incremental NDJSON decoder.
#[derive(Debug, Clone)]
pub struct NdjsonDecoder {
    /// Bytes of the current, not yet terminated line.
    pending: Vec<u8>,
    /// Maximum accepted line length.
    max_line: usize,
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NdjsonDecoder {
    /// Create a decoder with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }

    /// Create a decoder with a custom line limit.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
        }
    }

    /// Number of buffered bytes belonging to an unterminated line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed a chunk and decode every line it completes.
    ///
    /// Blank lines are skipped. On error the remainder of `chunk` is
    /// discarded; the decoder stays usable for later chunks.
    pub fn decode<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            self.push_pending(head)?;
            let line = std::mem::take(&mut self.pending);
            if let Some(item) = parse_line(&line)? {
                items.push(item);
            }
        }

        self.push_pending(rest)?;
        Ok(items)
    }

    /// Decode a trailing line that was not newline-terminated.
    ///
    /// Call once the transport reaches end of stream.
    pub fn finish<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let line = std::mem::take(&mut self.pending);
        parse_line(&line)
    }

    fn push_pending(&mut self, bytes: &[u8]) -> Result<()> {
        let size = self.pending.len() + bytes.len();
        if size > self.max_line {
            self.pending.clear();
            return Err(ProtocolError::LineTooLong {
                size,
                max: self.max_line,
            });
        }
        self.pending.extend_from_slice(bytes);
        Ok(())
    }
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Result<Option<T>> {
    let text = std::str::from_utf8(line)?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(text)?))
}
