//! Double write buffer.
//!
//! Holds a pair of chunked write buffers and an index selecting the current
//! half. Producers append to the current half; the I/O layer flips to take
//! the filled half for submission while appends continue into the other one.
//! At most one half is in flight at a time.

use super::chunked::{Chunk, WriteBuf};

/// Chunks kept on the free list; the rest go back to the allocator.
const FREE_LIST_LIMIT: usize = 32;

/// A pair of chunked write buffers alternating between filling and
/// in-flight roles, plus the shared chunk free list.
pub struct DoubleWriteBuf {
    bufs: [WriteBuf; 2],
    cur: usize,
    free: Vec<Box<Chunk>>,
}

impl Default for DoubleWriteBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl DoubleWriteBuf {
    /// Creates an empty pair.
    pub fn new() -> Self {
        Self {
            bufs: [WriteBuf::new(), WriteBuf::new()],
            cur: 0,
            free: Vec::new(),
        }
    }

    /// Appends data to the current half.
    pub fn append(&mut self, data: &[u8]) {
        self.bufs[self.cur].append(data, &mut self.free);
    }

    /// True when the current half holds no data.
    pub fn is_empty(&self) -> bool {
        self.bufs[self.cur].is_empty()
    }

    /// Takes the filled current half for submission and makes the other
    /// half current. The caller returns the taken half via
    /// [`retire`](Self::retire) once the write completes.
    pub fn flip(&mut self) -> WriteBuf {
        let out = std::mem::take(&mut self.bufs[self.cur]);
        self.cur ^= 1;
        out
    }

    /// Recycles a written-out half's chunks into the free list.
    pub fn retire(&mut self, mut buf: WriteBuf) {
        buf.drain_into(&mut self.free);
        self.free.truncate(FREE_LIST_LIMIT);
    }

    /// Drops all queued data from the current half.
    pub fn clear(&mut self) {
        let cur = std::mem::take(&mut self.bufs[self.cur]);
        self.retire(cur);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CHUNK_SIZE;

    fn collect(buf: &WriteBuf) -> Vec<u8> {
        let mut out = Vec::new();
        for c in buf.chunks() {
            out.extend_from_slice(c.filled());
        }
        out
    }

    #[test]
    fn test_flip_hands_over_current_half() {
        let mut dbuf = DoubleWriteBuf::new();
        dbuf.append(b"first");

        let taken = dbuf.flip();
        assert_eq!(collect(&taken), b"first");
        assert!(dbuf.is_empty());

        dbuf.retire(taken);
    }

    #[test]
    fn test_appends_during_flight_go_to_other_half() {
        let mut dbuf = DoubleWriteBuf::new();
        dbuf.append(b"in-flight");

        let flight = dbuf.flip();
        dbuf.append(b"queued");

        assert_eq!(collect(&flight), b"in-flight");
        let queued = dbuf.flip();
        assert_eq!(collect(&queued), b"queued");

        dbuf.retire(flight);
        dbuf.retire(queued);
    }

    #[test]
    fn test_alternating_flips_preserve_order() {
        let mut dbuf = DoubleWriteBuf::new();
        let mut wire = Vec::new();
        let mut expected = Vec::new();

        for i in 0..10u8 {
            let piece = vec![i; 300];
            dbuf.append(&piece);
            expected.extend_from_slice(&piece);
            if i % 2 == 1 {
                let half = dbuf.flip();
                wire.extend(collect(&half));
                dbuf.retire(half);
            }
        }
        let tail = dbuf.flip();
        wire.extend(collect(&tail));
        dbuf.retire(tail);

        assert_eq!(wire, expected);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let mut dbuf = DoubleWriteBuf::new();
        dbuf.append(&vec![0u8; CHUNK_SIZE * (FREE_LIST_LIMIT + 10)]);

        let half = dbuf.flip();
        dbuf.retire(half);

        assert!(dbuf.free.len() <= FREE_LIST_LIMIT);
    }

    #[test]
    fn test_clear_empties_current_half() {
        let mut dbuf = DoubleWriteBuf::new();
        dbuf.append(b"discard me");
        dbuf.clear();
        assert!(dbuf.is_empty());
    }
}
