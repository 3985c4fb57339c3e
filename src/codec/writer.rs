//! Packets to outgoing bytes
//!
//! [`PacketWriter`] owns the write half of one connection. Any number of
//! callers may enqueue packets concurrently; a compare-and-set on
//! `is_writing` admits a single drain task, which serializes and writes
//! queued packets one at a time and re-checks the queue before leaving.

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};

use super::framing::Framing;
use crate::buffer::BufferAllocator;
use crate::error::{NetworkError, Result};
use crate::packet::Protocol;

/// Write half of a plain or TLS stream
pub type PacketSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Called once a write fails in a way that ends the connection
pub(crate) type FailureHook = Box<dyn Fn(&NetworkError) + Send + Sync>;

/// Completion of one queued packet
pub(crate) type Feedback = oneshot::Sender<Result<()>>;

struct Outgoing<T> {
    packet: T,
    feedback: Option<Feedback>,
}

impl<T> Outgoing<T> {
    fn complete(self, result: Result<()>) {
        if let Some(feedback) = self.feedback {
            // receiver may have been dropped
            let _ = feedback.send(result);
        }
    }
}

/// Per-connection packet serializer and write queue
pub struct PacketWriter<P: Protocol> {
    framing: Framing,
    protocol: Arc<P>,
    allocator: Arc<dyn BufferAllocator>,
    handle: Handle,
    queue: Mutex<VecDeque<Outgoing<P::Packet>>>,
    is_writing: AtomicBool,
    closed: AtomicBool,
    write_buffer: Mutex<Option<BytesMut>>,
    write_buffer_size: usize,
    sink: tokio::sync::Mutex<Option<PacketSink>>,
    shutdown: watch::Receiver<bool>,
    activity: Arc<RwLock<Instant>>,
    on_failure: FailureHook,
}

impl<P: Protocol> PacketWriter<P> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        framing: Framing,
        protocol: Arc<P>,
        allocator: Arc<dyn BufferAllocator>,
        handle: Handle,
        sink: PacketSink,
        shutdown: watch::Receiver<bool>,
        activity: Arc<RwLock<Instant>>,
        on_failure: FailureHook,
    ) -> Arc<Self> {
        let write_buffer = allocator.take_write_buffer();
        let write_buffer_size = write_buffer.capacity();
        Arc::new(Self {
            framing,
            protocol,
            allocator,
            handle,
            queue: Mutex::new(VecDeque::new()),
            is_writing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            write_buffer: Mutex::new(Some(write_buffer)),
            write_buffer_size,
            sink: tokio::sync::Mutex::new(Some(sink)),
            shutdown,
            activity,
            on_failure,
        })
    }

    /// Queue a packet and make sure a drain is running
    pub(crate) fn enqueue(self: &Arc<Self>, packet: P::Packet, feedback: Option<Feedback>) {
        let outgoing = Outgoing { packet, feedback };
        {
            // checked under the queue lock so release() cannot miss the entry
            let mut queue = self.queue.lock();
            if self.is_closed() {
                drop(queue);
                outgoing.complete(Err(NetworkError::Closed));
                return;
            }
            queue.push_back(outgoing);
        }
        self.write_next_packet();
    }

    /// Start draining the queue unless a drain is already in flight.
    ///
    /// A no-op when the flag is taken, the queue is empty or the writer is
    /// closed, so it may be called from anywhere at any time.
    pub fn write_next_packet(self: &Arc<Self>) {
        if self.is_closed() || self.queue.lock().is_empty() {
            return;
        }
        if self
            .is_writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let writer = Arc::clone(self);
        self.handle.spawn(async move { writer.drain().await });
    }

    async fn drain(self: Arc<Self>) {
        loop {
            loop {
                let next = self.queue.lock().pop_front();
                let Some(outgoing) = next else { break };

                if self.is_closed() {
                    outgoing.complete(Err(NetworkError::Closed));
                    continue;
                }

                match self.write_one(&outgoing.packet).await {
                    Ok(()) => {
                        *self.activity.write() = Instant::now();
                        outgoing.complete(Ok(()));
                    }
                    Err(e) if e.is_connection_closed() || self.is_closed() => {
                        tracing::debug!("write failed on closing connection: {}", e);
                        (self.on_failure)(&e);
                        outgoing.complete(Err(e));
                    }
                    Err(e) => {
                        tracing::warn!("failed to write packet, continuing with next: {}", e);
                        outgoing.complete(Err(e));
                    }
                }
            }

            self.is_writing.store(false, Ordering::Release);

            // a packet enqueued after the last pop may have seen the flag set
            if self.is_closed() || self.queue.lock().is_empty() {
                return;
            }
            if self
                .is_writing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    async fn write_one(&self, packet: &P::Packet) -> Result<()> {
        let header = self.framing.header_size();
        let (mut buffer, temporary) = match self.protocol.expected_length(packet) {
            Some(length) if header + length > self.write_buffer_size => {
                (self.allocator.take_buffer(header + length), true)
            }
            _ => {
                let shared = self.write_buffer.lock().take();
                (shared.ok_or(NetworkError::Closed)?, false)
            }
        };

        let result = match self.framing.encode(&*self.protocol, packet, &mut buffer) {
            Ok(()) => {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    written = self.flush(&buffer) => written,
                    _ = shutdown.wait_for(|closed| *closed) => Err(NetworkError::Closed),
                }
            }
            Err(e) => Err(e),
        };

        if temporary {
            self.allocator.put_buffer(buffer);
        } else {
            self.restore_write_buffer(buffer);
        }
        result
    }

    async fn flush(&self, frame: &[u8]) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(NetworkError::Closed)?;
        sink.write_all(frame).await?;
        sink.flush().await?;
        Ok(())
    }

    fn restore_write_buffer(&self, buffer: BytesMut) {
        let mut slot = self.write_buffer.lock();
        if self.is_closed() {
            drop(slot);
            self.allocator.put_write_buffer(buffer);
        } else {
            *slot = Some(buffer);
        }
    }

    /// Packets queued and not yet picked up by the drain
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.queue.lock().len()
    }

    /// Check if the writer was released
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail queued packets, return the write buffer and shut the sink down.
    ///
    /// Idempotent. A buffer still held by an in-flight write goes back to the
    /// allocator when that write finishes.
    pub(crate) fn release(self: &Arc<Self>) {
        let abandoned: Vec<_> = {
            let mut queue = self.queue.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            queue.drain(..).collect()
        };
        for outgoing in abandoned {
            outgoing.complete(Err(NetworkError::Closed));
        }

        if let Some(buffer) = self.write_buffer.lock().take() {
            self.allocator.put_write_buffer(buffer);
        }

        let writer = Arc::clone(self);
        self.handle.spawn(async move {
            let sink = writer.sink.lock().await.take();
            if let Some(mut sink) = sink {
                if let Err(e) = sink.shutdown().await {
                    tracing::trace!("sink shutdown: {}", e);
                }
            }
        });
    }
}

impl<P: Protocol> fmt::Debug for PacketWriter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketWriter")
            .field("pending", &self.pending_writes())
            .field("writing", &self.is_writing.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBufferAllocator;
    use crate::codec::framing::{ByteOrder, HeaderWidth};
    use crate::codec::reader::PacketReader;
    use crate::packet::{RawPacket, RawProtocol};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use tokio::io::DuplexStream;

    fn framing(max: usize) -> Framing {
        Framing {
            length: HeaderWidth::Four,
            id: None,
            order: ByteOrder::BigEndian,
            max_packet_size: max,
        }
    }

    struct Harness {
        writer: Arc<PacketWriter<RawProtocol>>,
        allocator: Arc<PooledBufferAllocator>,
        failures: Arc<AtomicUsize>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(sink: PacketSink, max: usize) -> Harness {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
        let failures = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counter = Arc::clone(&failures);
        let writer = PacketWriter::new(
            framing(max),
            Arc::new(RawProtocol),
            allocator.clone(),
            Handle::current(),
            sink,
            shutdown_rx,
            Arc::new(RwLock::new(Instant::now())),
            Box::new(move |_: &NetworkError| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Harness {
            writer,
            allocator,
            failures,
            _shutdown: shutdown_tx,
        }
    }

    async fn read_payloads(peer: &mut DuplexStream, count: usize) -> Vec<Vec<u8>> {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(256, 256, 512));
        let mut reader = PacketReader::new(framing(1 << 20), allocator);
        let mut payloads = Vec::new();
        while payloads.len() < count {
            while let Some(packet) = reader.next_packet(&RawProtocol).unwrap() {
                payloads.push(packet.into_payload().to_vec());
            }
            if payloads.len() < count {
                assert!(reader.read_from(peer).await.unwrap() > 0);
            }
        }
        payloads
    }

    #[tokio::test]
    async fn test_queued_packets_are_written_in_order() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let h = harness(Box::new(local), 1024);

        for i in 0..50u32 {
            h.writer
                .enqueue(RawPacket::from(format!("packet-{}", i)), None);
        }

        let payloads = read_payloads(&mut peer, 50).await;
        for (i, payload) in payloads.iter().enumerate() {
            assert_eq!(payload, format!("packet-{}", i).as_bytes());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_never_interleave_frames() {
        let (local, mut peer) = tokio::io::duplex(1 << 16);
        let h = harness(Box::new(local), 1 << 16);

        let mut tasks = Vec::new();
        for sender in 0..8u8 {
            let writer = Arc::clone(&h.writer);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    writer.enqueue(RawPacket::from(vec![sender; 300]), None);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let payloads = read_payloads(&mut peer, 200).await;
        for payload in payloads {
            assert_eq!(payload.len(), 300);
            assert!(payload.iter().all(|b| *b == payload[0]));
        }
    }

    #[tokio::test]
    async fn test_failed_packet_does_not_block_queue() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let h = harness(Box::new(local), 16);

        let (too_big_tx, too_big_rx) = oneshot::channel();
        let (ok_tx, ok_rx) = oneshot::channel();
        h.writer
            .enqueue(RawPacket::from(vec![0u8; 100]), Some(too_big_tx));
        h.writer.enqueue(RawPacket::from("fits"), Some(ok_tx));

        assert!(matches!(
            too_big_rx.await.unwrap(),
            Err(NetworkError::MessageTooLarge(100, 16))
        ));
        ok_rx.await.unwrap().unwrap();
        assert_eq!(read_payloads(&mut peer, 1).await, vec![b"fits".to_vec()]);
        assert_eq!(h.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_large_packet_uses_temporary_buffer() {
        let (local, mut peer) = tokio::io::duplex(1 << 16);
        let h = harness(Box::new(local), 1 << 16);

        let (tx, rx) = oneshot::channel();
        h.writer.enqueue(RawPacket::from(vec![1u8; 5_000]), Some(tx));
        rx.await.unwrap().unwrap();
        assert_eq!(read_payloads(&mut peer, 1).await[0].len(), 5_000);

        // the temporary buffer went back to the sized pool
        let reused = h.allocator.take_buffer(5_000);
        assert!(reused.capacity() >= 5_004);
        assert_eq!(h.allocator.stats().reused, 1);
    }

    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_closed_channel_triggers_failure_hook() {
        let h = harness(Box::new(BrokenSink), 1024);

        let (tx, rx) = oneshot::channel();
        h.writer.enqueue(RawPacket::from("lost"), Some(tx));

        assert!(rx.await.unwrap().unwrap_err().is_connection_closed());
        assert_eq!(h.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_fails_new_packets_and_returns_buffer() {
        let (local, _peer) = tokio::io::duplex(64);
        let h = harness(Box::new(local), 1024);

        h.writer.release();
        h.writer.release();

        let (tx, rx) = oneshot::channel();
        h.writer.enqueue(RawPacket::from("late"), Some(tx));
        assert!(matches!(rx.await.unwrap(), Err(NetworkError::Closed)));
        assert_eq!(h.allocator.stats().returned, 1);
        assert_eq!(h.writer.pending_writes(), 0);
    }
}
