//! Reusable I/O buffers
//!
//! Connections take their read, write and pending buffers from a shared
//! [`BufferAllocator`] and hand them back when they close. Frames larger than
//! the configured sizes use ad-hoc buffers from a capacity-searchable pool.

mod allocator;

pub use allocator::{AllocatorStats, PooledBufferAllocator};

use bytes::BytesMut;

/// Source of reusable buffers
///
/// Every buffer taken must be returned exactly once, to the pool of the same
/// kind, and never used afterwards.
pub trait BufferAllocator: Send + Sync {
    /// Take a cleared buffer of the configured read size
    fn take_read_buffer(&self) -> BytesMut;

    /// Take a cleared buffer of the configured write size
    fn take_write_buffer(&self) -> BytesMut;

    /// Take a cleared buffer of the configured pending size
    fn take_pending_buffer(&self) -> BytesMut;

    /// Take a cleared buffer with capacity of at least `size`
    fn take_buffer(&self, size: usize) -> BytesMut;

    /// Return a read buffer
    fn put_read_buffer(&self, buffer: BytesMut);

    /// Return a write buffer
    fn put_write_buffer(&self, buffer: BytesMut);

    /// Return a pending buffer
    fn put_pending_buffer(&self, buffer: BytesMut);

    /// Return a buffer obtained from [`BufferAllocator::take_buffer`]
    fn put_buffer(&self, buffer: BytesMut);
}
