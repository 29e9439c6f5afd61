//! Growable byte buffer with read/write cursors.
//!
//! `ByteBuffer` backs both sides of a connection: the inbound stream
//! accumulates partial frames in one, and every entry of the outbound
//! queue is one. The readable region `[read_pos, write_pos)` holds
//! bytes produced but not yet consumed; the writable region
//! `[write_pos, capacity)` is where the next read syscall or encoder
//! lands.

/// Contiguous byte region with `read_pos <= write_pos <= capacity`.
///
/// Growth is explicit: `ensure` makes room for a known number of
/// incoming bytes (compacting first when the consumed prefix can be
/// reclaimed), `enlarge` grows the backing storage unconditionally.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteBuffer {
    /// Create an empty buffer with the given capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0u8; cap],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Create a buffer whose readable region is a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            read_pos: 0,
            write_pos: bytes.len(),
        }
    }

    /// Take ownership of `data`, treating all of it as readable.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data,
            read_pos: 0,
            write_pos: len,
        }
    }

    /// Bytes written but not yet consumed.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Length of the readable region.
    pub fn readable_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Room left for writing without growth.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Length of the writable region.
    pub fn writable_len(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Total capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// True when no readable bytes remain.
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Consume `n` readable bytes.
    pub fn mark_read(&mut self, n: usize) {
        debug_assert!(n <= self.readable_len(), "mark_read past write cursor");
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            // nothing left in flight, reclaim the whole region
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Commit `n` bytes written into the writable region.
    pub fn mark_write(&mut self, n: usize) {
        debug_assert!(n <= self.writable_len(), "mark_write past capacity");
        self.write_pos += n;
    }

    /// Make the writable region at least `n` bytes.
    ///
    /// Compacts first: the readable region is shifted to offset 0 so
    /// already-consumed space is reclaimed before any allocation.
    pub fn ensure(&mut self, n: usize) {
        if self.writable_len() >= n {
            return;
        }
        self.compact();
        if self.writable_len() < n {
            let short = n - self.writable_len();
            self.enlarge(short);
        }
    }

    /// Grow the backing storage by at least `n` bytes.
    pub fn enlarge(&mut self, n: usize) {
        let grow = n.max(self.data.len());
        self.data.resize(self.data.len() + grow, 0);
    }

    /// Append `bytes`, growing as needed.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }
}
