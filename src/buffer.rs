//! Reusable read buffers shared by every connection
//!
//! Buffers are bucketed by power-of-two size class. A connection checks one
//! out when it starts, grows it by doubling while a request head does not
//! fit, and hands it back when it is dropped.

use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Initial buffer size, large enough for the header budget of common proxies
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Buffers kept per size class
const DEFAULT_RETAINED_PER_CLASS: usize = 64;

pub struct BufferPool {
    classes: DashMap<usize, Vec<Vec<u8>>>,
    retained_per_class: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_RETAINED_PER_CLASS)
    }
}

impl BufferPool {
    pub fn new(retained_per_class: usize) -> Self {
        Self {
            classes: DashMap::new(),
            retained_per_class,
        }
    }

    fn size_class(min_size: usize) -> usize {
        min_size.max(1).next_power_of_two()
    }

    fn take(&self, min_size: usize) -> Vec<u8> {
        let class = Self::size_class(min_size);
        self.classes
            .get_mut(&class)
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0; class])
    }

    fn release(&self, buffer: Vec<u8>) {
        let class = buffer.len();
        if !class.is_power_of_two() {
            return;
        }
        let mut free = self.classes.entry(class).or_default();
        if free.len() < self.retained_per_class {
            free.push(buffer);
        }
    }

    /// Check out a buffer of at least `min_size` bytes
    pub fn checkout(self: &Arc<Self>, min_size: usize) -> PooledBuffer {
        PooledBuffer {
            buffer: self.take(min_size),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers of the given size class
    pub fn idle(&self, class: usize) -> usize {
        self.classes.get(&class).map(|free| free.len()).unwrap_or(0)
    }
}

/// A buffer on loan from a [`BufferPool`]; derefs to its full capacity
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Double the capacity, keeping the first `filled` bytes
    pub fn grow(&mut self, filled: usize) {
        let mut larger = self.pool.take(self.buffer.len() * 2);
        larger[..filled].copy_from_slice(&self.buffer[..filled]);
        let old = std::mem::replace(&mut self.buffer, larger);
        self.pool.release(old);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.release(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_rounds_to_size_class() {
        let pool = Arc::new(BufferPool::default());
        let buffer = pool.checkout(10_000);
        assert_eq!(buffer.len(), 16_384);
    }

    #[test]
    fn test_buffers_are_reused() {
        let pool = Arc::new(BufferPool::default());
        {
            let _a = pool.checkout(DEFAULT_BUFFER_SIZE);
            let _b = pool.checkout(DEFAULT_BUFFER_SIZE);
        }
        assert_eq!(pool.idle(DEFAULT_BUFFER_SIZE), 2);

        let _c = pool.checkout(DEFAULT_BUFFER_SIZE);
        assert_eq!(pool.idle(DEFAULT_BUFFER_SIZE), 1);
    }

    #[test]
    fn test_grow_keeps_content_and_returns_old_buffer() {
        let pool = Arc::new(BufferPool::default());
        let mut buffer = pool.checkout(8);
        buffer[..4].copy_from_slice(b"abcd");

        buffer.grow(4);
        assert_eq!(buffer.len(), 16);
        assert_eq!(&buffer[..4], b"abcd");
        assert_eq!(pool.idle(8), 1);

        drop(buffer);
        assert_eq!(pool.idle(16), 1);
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = Arc::new(BufferPool::new(1));
        let a = pool.checkout(32);
        let b = pool.checkout(32);
        drop(a);
        drop(b);
        assert_eq!(pool.idle(32), 1);
    }
}
