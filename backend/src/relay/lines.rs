//! Splits a chunked byte stream into lines.

use thiserror::Error;

/// Default upper bound on one line, terminator excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1 << 20;

/// A line grew past the buffer's limit.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("line exceeds {0} bytes")]
pub struct LineTooLong(pub usize);

/// Accumulates bytes and yields complete `\n`-terminated lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no `\n`.
    scanned: usize,
    max_line_bytes: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line without its terminator.
    ///
    /// Fails once the pending line is longer than the limit, whether or not
    /// its terminator has arrived.
    pub fn next_line(&mut self) -> Result<Option<String>, LineTooLong> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buf.len();
            if self.buf.len() > self.max_line_bytes {
                return Err(LineTooLong(self.max_line_bytes));
            }
            return Ok(None);
        };

        let pos = self.scanned + offset;
        if pos > self.max_line_bytes {
            return Err(LineTooLong(self.max_line_bytes));
        }

        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        self.scanned = 0;
        Ok(Some(String::from_utf8_lossy(&line[..pos]).into_owned()))
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
