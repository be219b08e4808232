//! Bounded replay buffer for session output.
//!
//! Every byte the shell writes is appended here so a reattaching client can
//! be shown recent history. When the buffer grows past its limit the oldest
//! bytes are dropped; the retained suffix never starts in the middle of a
//! UTF-8 sequence.

/// Append-only byte buffer that keeps the most recent `max_bytes` of output.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: Vec<u8>,
    max_bytes: usize,
}

impl OutputBuffer {
    /// Create an empty buffer holding at most `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: Vec::new(),
            max_bytes,
        }
    }

    /// Append output, dropping the oldest bytes if the limit is exceeded.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.max_bytes {
            self.data.clear();
            let start = chunk.len() - self.max_bytes;
            self.data
                .extend_from_slice(&chunk[char_start(chunk, start)..]);
            return;
        }

        self.data.extend_from_slice(chunk);
        if self.data.len() > self.max_bytes {
            let excess = self.data.len() - self.max_bytes;
            let cut = char_start(&self.data, excess);
            self.data.drain(..cut);
        }
    }

    /// Buffered bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Buffered output decoded as UTF-8, invalid sequences replaced.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Configured byte limit.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

/// Advance `pos` past UTF-8 continuation bytes.
fn char_start(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && is_continuation(bytes[pos]) {
        pos += 1;
    }
    pos
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

/// Length of an incomplete UTF-8 sequence at the end of `bytes`.
///
/// Returns 0 when `bytes` ends on a character boundary (or with bytes that
/// can never become valid, which are passed through for lossy decoding).
pub fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if is_continuation(byte) {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}
