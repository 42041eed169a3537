//! Append-only receive buffer with line extraction.
//!
//! One buffer lives per connection. The transport appends raw bytes; the
//! parser pulls CRLF-terminated lines (CR-permissive), complete header
//! blocks, or bounded byte runs. Extraction splits off the front of the
//! backing `BytesMut`, so no bytes are copied.

use bytes::{Buf, Bytes, BytesMut};

/// HTTP token characters (RFC 7230 `tchar`).
pub(crate) fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    data: BytesMut,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        ReceiveBuffer { data: BytesMut::new() }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Extract one line if a terminator has arrived. The returned line has
    /// its `\r\n` (or bare `\n`) stripped.
    pub fn maybe_extract_next_line(&mut self) -> Option<Bytes> {
        let newline = memchr::memchr(b'\n', &self.data)?;
        let line = self.data.split_to(newline + 1).freeze();
        Some(trim_line_ending(line))
    }

    /// Extract all currently complete lines up to (and consuming) the blank
    /// separator. Returns `None` until the blank line arrives; returns an
    /// empty vec when the buffer begins with a blank line.
    pub fn maybe_extract_lines(&mut self) -> Option<Vec<Bytes>> {
        if self.data.starts_with(b"\r\n") {
            self.data.advance(2);
            return Some(Vec::new());
        }
        if self.data.starts_with(b"\n") {
            self.data.advance(1);
            return Some(Vec::new());
        }

        let end = self.find_blank_line()?;
        let block = self.data.split_to(end).freeze();

        let mut lines = Vec::new();
        let mut cursor = 0;
        while cursor < block.len() {
            let line_end = memchr::memchr(b'\n', &block[cursor..])
                .map(|offset| cursor + offset + 1)
                .unwrap_or(block.len());
            let line = trim_line_ending(block.slice(cursor..line_end));
            if !line.is_empty() {
                lines.push(line);
            }
            cursor = line_end;
        }

        Some(lines)
    }

    /// Extract at most `max` bytes. Returns `None` when the buffer is empty.
    pub fn maybe_extract_at_most(&mut self, max: usize) -> Option<Bytes> {
        if self.data.is_empty() {
            return None;
        }
        let take = max.min(self.data.len());
        Some(self.data.split_to(take).freeze())
    }

    /// Detect an obviously bad request line before its CRLF has arrived, by
    /// scanning the method span for non-token characters.
    pub fn is_next_line_obviously_invalid_request_line(&self) -> bool {
        for &byte in self.data.iter().take(32) {
            if byte == b' ' || byte == b'\r' || byte == b'\n' {
                break;
            }
            if !is_token_char(byte) {
                return true;
            }
        }
        false
    }

    /// FNV-1a hash of the unconsumed bytes.
    pub fn fingerprint(&self) -> u64 {
        crate::http::fnv1a(0xcbf2_9ce4_8422_2325, &self.data)
    }

    /// Offset one past the header/body separator (`\n\r\n` or `\n\n`), if
    /// the separator is buffered.
    fn find_blank_line(&self) -> Option<usize> {
        let mut search_from = 0;
        while let Some(offset) = memchr::memchr(b'\n', &self.data[search_from..]) {
            let newline = search_from + offset;
            if self.data[newline + 1..].starts_with(b"\r\n") {
                return Some(newline + 3);
            }
            if self.data[newline + 1..].starts_with(b"\n") {
                return Some(newline + 2);
            }
            search_from = newline + 1;
        }
        None
    }
}

fn trim_line_ending(line: Bytes) -> Bytes {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    line.slice(..end)
}
