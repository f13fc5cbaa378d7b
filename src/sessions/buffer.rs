//! Byte-bounded replay buffer.
//!
//! [`ReplayBuffer`] keeps the most recent output of one terminal so a client
//! that reconnects can redraw. Capacity is in bytes; when a push overflows it,
//! the oldest bytes are dropped so the buffer always equals the tail of the
//! output stream.

use std::collections::VecDeque;

pub struct ReplayBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// Total bytes ever pushed (including evicted ones).
    total: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(8192)),
            capacity,
            total: 0,
        }
    }

    /// Append `chunk`, evicting from the front to stay within capacity.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if chunk.len() >= self.capacity {
            self.data.clear();
            self.data.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(chunk);
    }

    /// Copy of the buffered bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (a, b) = self.data.as_slices();
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    /// Buffered bytes as text for replay. Leading UTF-8 continuation bytes
    /// (left over from front eviction) are skipped.
    pub fn snapshot_text(&self) -> String {
        let bytes = self.snapshot();
        let start = bytes
            .iter()
            .position(|b| b & 0b1100_0000 != 0b1000_0000)
            .unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes evicted so far.
    pub fn dropped(&self) -> u64 {
        self.total - self.data.len() as u64
    }
}
