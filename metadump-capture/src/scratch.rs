//! Session owned scratch space for the attribute queries.

/// Initial capacity, enough for typical attribute lists and values.
const INITIAL_CAPACITY: usize = 512;

/// Reusable byte buffer for the size-then-fill queries. It only ever
/// grows, so a walk settles on the largest attribute seen and stops
/// allocating.
pub struct ScratchBuffer {
    data: Vec<u8>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; INITIAL_CAPACITY],
        }
    }

    /// Grow to at least `size` bytes and return that prefix.
    pub fn bytes_mut(&mut self, size: usize) -> &mut [u8] {
        if self.data.len() < size {
            self.data.resize(size, 0);
        }
        &mut self.data[..size]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_scratch_only_grows() {
    let mut buffer = ScratchBuffer::new();
    assert_eq!(buffer.capacity(), INITIAL_CAPACITY);

    assert_eq!(buffer.bytes_mut(16).len(), 16);
    assert_eq!(buffer.capacity(), INITIAL_CAPACITY);

    assert_eq!(buffer.bytes_mut(2048).len(), 2048);
    assert_eq!(buffer.capacity(), 2048);

    // shrinking requests reuse the grown allocation
    assert_eq!(buffer.bytes_mut(8).len(), 8);
    assert_eq!(buffer.capacity(), 2048);
}
