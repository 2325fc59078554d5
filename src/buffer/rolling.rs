//! Rolling read buffer.
//!
//! A backing vector with independent `head` and `tail` indices. The socket
//! reads into the spare region past `head`; the frame parser consumes from
//! `tail`. Erasing parsed frames just advances `tail`; the buffer compacts
//! (moves the live bytes to offset zero) only when more room is needed, so
//! steady-state parsing does no copying at all.

/// Largest frame is 65535 bytes, so this bound always leaves room for one
/// whole frame plus read-ahead after a compact.
const MAX_CAPACITY: usize = 128 * 1024;

/// Read buffer with head/tail indices over a growable backing vector.
pub struct RollingBuffer {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
}

impl RollingBuffer {
    /// Creates a buffer with the given initial capacity (at least 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
            head: 0,
            tail: 0,
        }
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        debug_assert!(self.head >= self.tail);
        self.head - self.tail
    }

    /// True when no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total capacity of the backing vector.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Free bytes past `head`, available for the next read.
    pub fn free_capacity(&self) -> usize {
        self.buf.len() - self.head
    }

    /// The unconsumed byte range.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.tail..self.head]
    }

    /// The writable region past `head`; pair with [`grow`](Self::grow).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..]
    }

    /// Marks `n` bytes written by a completed read.
    pub fn grow(&mut self, n: usize) {
        debug_assert!(n <= self.free_capacity());
        self.head += n;
    }

    /// Consumes `n` bytes from the front.
    pub fn erase(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.tail += n;
        if self.tail == self.head {
            self.tail = 0;
            self.head = 0;
        }
    }

    /// Resets the buffer without releasing memory.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Moves the live bytes to offset zero, making the consumed prefix
    /// available for reads again.
    pub fn compact(&mut self) {
        if self.tail > 0 {
            self.buf.copy_within(self.tail..self.head, 0);
            self.head -= self.tail;
            self.tail = 0;
        }
    }

    /// Ensures `free_capacity() > 0`: compacts first, and only grows the
    /// backing vector (doubling, bounded) when the live bytes already start
    /// at offset zero.
    pub fn grow_capacity(&mut self) {
        if self.tail > 0 {
            self.compact();
        } else if self.head == self.buf.len() {
            let new_len = (self.buf.len() * 2).min(MAX_CAPACITY);
            self.buf.resize(new_len, 0);
        }
        debug_assert!(self.free_capacity() > 0);
    }
}
