//! Growable byte queue used for inbound accumulation.

use bytes::{Buf, Bytes, BytesMut};

/// FIFO of bytes: append at the back, consume from the front
#[derive(Debug, Default)]
pub struct ByteQueue {
    buf: BytesMut,
}

impl ByteQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes at the back
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Everything not consumed yet
    pub fn readable(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` bytes from the front
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Remove up to `n` bytes from the front
    pub fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n.min(self.buf.len())).freeze()
    }

    /// Bytes held
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
