//! Chunked write buffer.
//!
//! Outbound bytes accumulate in a list of fixed 1 KiB chunks. Chunks are
//! recycled through a free list instead of being returned to the allocator,
//! so a busy session settles into a steady state with zero allocations per
//! write.

/// Fixed chunk payload size.
pub const CHUNK_SIZE: usize = 1024;

/// One fixed-size block of outbound bytes.
pub struct Chunk {
    len: usize,
    data: [u8; CHUNK_SIZE],
}

impl Chunk {
    fn new() -> Box<Chunk> {
        Box::new(Chunk {
            len: 0,
            data: [0; CHUNK_SIZE],
        })
    }

    /// The written prefix of the chunk.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Number of written bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn free_capacity(&self) -> usize {
        CHUNK_SIZE - self.len
    }

    /// Copies in as much of `data` as fits; returns the number taken.
    fn append(&mut self, data: &[u8]) -> usize {
        let n = self.free_capacity().min(data.len());
        self.data[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

/// An ordered list of live chunks.
#[derive(Default)]
pub struct WriteBuf {
    chunks: Vec<Box<Chunk>>,
}

impl WriteBuf {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// True when no bytes are queued.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total queued bytes across all chunks.
    pub fn total_len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    /// Live chunks in append order.
    pub fn chunks(&self) -> &[Box<Chunk>] {
        &self.chunks
    }

    /// Appends `data`, filling the tail chunk first and pulling further
    /// chunks from `free` (or the allocator) as needed.
    pub fn append(&mut self, mut data: &[u8], free: &mut Vec<Box<Chunk>>) {
        while !data.is_empty() {
            if let Some(tail) = self.chunks.last_mut() {
                let taken = tail.append(data);
                if taken > 0 {
                    data = &data[taken..];
                    continue;
                }
            }
            self.chunks.push(free.pop().unwrap_or_else(Chunk::new));
        }
    }

    /// Releases every chunk back to the free list.
    pub fn drain_into(&mut self, free: &mut Vec<Box<Chunk>>) {
        for mut chunk in self.chunks.drain(..) {
            chunk.clear();
            free.push(chunk);
        }
    }
}
