//! Per-flow, per-direction byte accumulator.
//!
//! Bytes arrive in arbitrary fragments. The accumulator keeps everything
//! that has not yet been carved into a complete message, plus a cursor that
//! marks where unparsed data starts.

/// Growable buffer with a parse cursor.
///
/// Invariant: every byte ever appended is either part of a range handed out
/// by [`ByteAccumulator::take`], passed over by [`ByteAccumulator::skip`], or
/// still present in the buffer at or after the cursor, in order.
#[derive(Debug, Default, Clone)]
pub struct ByteAccumulator {
    buffer: Vec<u8>,
    cursor: usize,
    /// Offset from the cursor before which no header terminator starts.
    head_scan: usize,
}

impl ByteAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment. Empty fragments are a no-op.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the bytes that have not been carved yet.
    pub fn unparsed(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    /// Returns the current cursor position within the buffer.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Hands out the next `len` unparsed bytes and moves the cursor past them.
    ///
    /// `len` is clamped to the unparsed length.
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        let end = self.cursor + len.min(self.unparsed_len());
        let taken = self.buffer[self.cursor..end].to_vec();
        self.advance(end);
        taken
    }

    /// Moves the cursor past the next `len` unparsed bytes without copying
    /// them. Returns how many bytes were skipped.
    pub fn skip(&mut self, len: usize) -> usize {
        let len = len.min(self.unparsed_len());
        self.advance(self.cursor + len);
        len
    }

    fn advance(&mut self, end: usize) {
        self.head_scan = self.head_scan.saturating_sub(end - self.cursor);
        self.cursor = end;
    }

    /// Where the next header terminator search may start, relative to the
    /// cursor.
    pub fn head_scan(&self) -> usize {
        self.head_scan.min(self.unparsed_len())
    }

    /// Records that no header terminator starts before `offset`.
    pub fn set_head_scan(&mut self, offset: usize) {
        self.head_scan = offset.min(self.unparsed_len());
    }

    /// Drops the consumed prefix so the cursor returns to zero.
    pub fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        if self.cursor >= self.buffer.len() {
            self.buffer.clear();
        } else {
            self.buffer.drain(..self.cursor);
        }
        self.cursor = 0;
    }

    /// Discards all buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.head_scan = 0;
    }

    /// Number of bytes not yet carved.
    pub fn unparsed_len(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Returns true if nothing is left to parse.
    pub fn is_empty(&self) -> bool {
        self.unparsed_len() == 0
    }
}
