use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use super::BufferAllocator;
use crate::core::config::NetworkConfig;

/// Allocation counters of a [`PooledBufferAllocator`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Buffers created because no pooled buffer fit
    pub allocated: u64,
    /// Takes served from a pool
    pub reused: u64,
    /// Buffers handed back
    pub returned: u64,
}

/// Fixed-size buffer pool
struct FixedPool {
    size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl FixedPool {
    fn new(size: usize) -> Self {
        Self {
            size,
            buffers: Mutex::new(Vec::new()),
        }
    }
}

/// Buffer allocator backed by per-kind pools
///
/// Pools grow without an upper bound; their size is bounded indirectly by the
/// number of connections and by the reader's packet-size ceiling.
pub struct PooledBufferAllocator {
    read: FixedPool,
    write: FixedPool,
    pending: FixedPool,
    /// Over-size buffers, searched by capacity
    sized: RwLock<Vec<BytesMut>>,
    allocated: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
}

impl PooledBufferAllocator {
    /// Create an allocator using the buffer sizes of `config`
    #[must_use]
    pub fn new(config: &NetworkConfig) -> Self {
        Self::with_sizes(
            config.read_buffer_size,
            config.write_buffer_size,
            config.pending_buffer_size,
        )
    }

    /// Create an allocator with explicit buffer sizes
    #[must_use]
    pub fn with_sizes(read: usize, write: usize, pending: usize) -> Self {
        Self {
            read: FixedPool::new(read),
            write: FixedPool::new(write),
            pending: FixedPool::new(pending),
            sized: RwLock::new(Vec::new()),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
        }
    }

    /// Buffers currently idle across all pools
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.read.buffers.lock().len()
            + self.write.buffers.lock().len()
            + self.pending.buffers.lock().len()
            + self.sized.read().len()
    }

    fn allocate(&self, size: usize) -> BytesMut {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(size)
    }

    fn take_fixed(&self, pool: &FixedPool) -> BytesMut {
        let pooled = pool.buffers.lock().pop();
        match pooled {
            Some(mut buffer) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buffer.clear();
                if buffer.capacity() < pool.size {
                    buffer.reserve(pool.size);
                }
                buffer
            }
            None => self.allocate(pool.size),
        }
    }

    fn put_fixed(&self, pool: &FixedPool, mut buffer: BytesMut) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        buffer.clear();
        pool.buffers.lock().push(buffer);
    }

    /// Index of the smallest pooled buffer holding at least `size` bytes
    fn best_fit(buffers: &[BytesMut], size: usize) -> Option<usize> {
        buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= size)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(index, _)| index)
    }
}

impl BufferAllocator for PooledBufferAllocator {
    fn take_read_buffer(&self) -> BytesMut {
        self.take_fixed(&self.read)
    }

    fn take_write_buffer(&self) -> BytesMut {
        self.take_fixed(&self.write)
    }

    fn take_pending_buffer(&self) -> BytesMut {
        self.take_fixed(&self.pending)
    }

    fn take_buffer(&self, size: usize) -> BytesMut {
        // optimistic scan under the shared lock
        let candidate = Self::best_fit(&self.sized.read(), size);

        if candidate.is_some() {
            let mut sized = self.sized.write();
            // another taker may have removed or replaced it in between
            let index = match candidate {
                Some(index) if index < sized.len() && sized[index].capacity() >= size => {
                    Some(index)
                }
                _ => Self::best_fit(&sized, size),
            };
            if let Some(index) = index {
                let mut buffer = sized.swap_remove(index);
                drop(sized);
                self.reused.fetch_add(1, Ordering::Relaxed);
                buffer.clear();
                return buffer;
            }
        }

        self.allocate(size)
    }

    fn put_read_buffer(&self, buffer: BytesMut) {
        self.put_fixed(&self.read, buffer);
    }

    fn put_write_buffer(&self, buffer: BytesMut) {
        self.put_fixed(&self.write, buffer);
    }

    fn put_pending_buffer(&self, buffer: BytesMut) {
        self.put_fixed(&self.pending, buffer);
    }

    fn put_buffer(&self, mut buffer: BytesMut) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        buffer.clear();
        self.sized.write().push(buffer);
    }
}

impl std::fmt::Debug for PooledBufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBufferAllocator")
            .field("read_size", &self.read.size)
            .field("write_size", &self.write.size)
            .field("pending_size", &self.pending.size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::sync::Arc;

    #[test]
    fn test_fixed_pools_reuse_returned_buffers() {
        let allocator = PooledBufferAllocator::with_sizes(128, 256, 512);

        let read = allocator.take_read_buffer();
        let write = allocator.take_write_buffer();
        let pending = allocator.take_pending_buffer();
        assert!(read.capacity() >= 128);
        assert!(write.capacity() >= 256);
        assert!(pending.capacity() >= 512);
        assert_eq!(allocator.stats().allocated, 3);

        allocator.put_read_buffer(read);
        allocator.put_write_buffer(write);
        allocator.put_pending_buffer(pending);
        assert_eq!(allocator.pooled(), 3);

        let _read = allocator.take_read_buffer();
        let _write = allocator.take_write_buffer();
        let _pending = allocator.take_pending_buffer();

        let stats = allocator.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.reused, 3);
        assert_eq!(stats.returned, 3);
    }

    #[test]
    fn test_taken_buffers_are_cleared() {
        let allocator = PooledBufferAllocator::with_sizes(64, 64, 128);

        let mut read = allocator.take_read_buffer();
        read.put_slice(b"stale bytes");
        allocator.put_read_buffer(read);

        let read = allocator.take_read_buffer();
        assert!(read.is_empty());
        assert!(read.capacity() >= 64);
    }

    #[test]
    fn test_sized_pool_finds_large_enough_buffer() {
        let allocator = PooledBufferAllocator::with_sizes(64, 64, 128);

        let small = allocator.take_buffer(1_000);
        let large = allocator.take_buffer(10_000);
        allocator.put_buffer(small);
        allocator.put_buffer(large);

        let fitted = allocator.take_buffer(5_000);
        assert!(fitted.capacity() >= 10_000);
        assert_eq!(allocator.stats().reused, 1);

        // nothing pooled is big enough
        let fresh = allocator.take_buffer(50_000);
        assert!(fresh.capacity() >= 50_000);
        assert_eq!(allocator.stats().allocated, 3);
    }

    #[test]
    fn test_sized_pool_prefers_smallest_fit() {
        let allocator = PooledBufferAllocator::with_sizes(64, 64, 128);
        allocator.put_buffer(BytesMut::with_capacity(8_000));
        allocator.put_buffer(BytesMut::with_capacity(2_000));
        allocator.put_buffer(BytesMut::with_capacity(4_000));

        let buffer = allocator.take_buffer(1_500);
        assert!(buffer.capacity() >= 2_000 && buffer.capacity() < 4_000);
    }

    #[test]
    fn test_concurrent_takes_never_share_a_buffer() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
        for _ in 0..8 {
            allocator.put_buffer(BytesMut::with_capacity(4096));
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    let buffer = allocator.take_buffer(4096);
                    buffer.as_ptr() as usize
                })
            })
            .collect();

        let mut pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        pointers.sort_unstable();
        pointers.dedup();
        assert_eq!(pointers.len(), 8);
        assert_eq!(allocator.stats().reused, 8);
    }
}
