//! Incoming byte stream to packets
//!
//! [`PacketReader`] is a state machine over a pending buffer. Bytes read from
//! the socket are appended, complete frames are sliced out and decoded, and
//! any partial frame stays buffered until more bytes arrive.

use bytes::BytesMut;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::framing::Framing;
use crate::buffer::BufferAllocator;
use crate::error::{NetworkError, Result};
use crate::packet::Protocol;

/// Where the reader is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Waiting for a complete length header
    AwaitLength,
    /// Length known, waiting for the rest of the frame
    AwaitBody { length: usize },
    /// Terminal; entered on release or on any framing failure
    Closed,
}

/// Per-connection frame decoder
pub struct PacketReader {
    framing: Framing,
    allocator: Arc<dyn BufferAllocator>,
    state: ReaderState,
    read: Option<BytesMut>,
    pending: Option<BytesMut>,
    /// Start of unconsumed bytes in `pending`
    pos: usize,
    /// Usable size of `pending`, fixed when the buffer was taken
    capacity: usize,
    /// Size of a regular pending buffer
    pending_size: usize,
    /// `pending` came from `take_buffer` rather than the pending pool
    oversized: bool,
}

impl PacketReader {
    /// Create a reader taking its buffers from `allocator`
    pub fn new(framing: Framing, allocator: Arc<dyn BufferAllocator>) -> Self {
        let read = allocator.take_read_buffer();
        let pending = allocator.take_pending_buffer();
        let capacity = pending.capacity();
        Self {
            framing,
            allocator,
            state: ReaderState::AwaitLength,
            read: Some(read),
            pending: Some(pending),
            pos: 0,
            capacity,
            pending_size: capacity,
            oversized: false,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Check if the reader reached its terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ReaderState::Closed
    }

    /// Bytes buffered but not yet consumed as a frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.len() - self.pos)
    }

    /// Read once from `src` into the read buffer and append the bytes.
    ///
    /// Returns the number of bytes read; `0` means end of stream.
    pub async fn read_from<R>(&mut self, src: &mut R) -> Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let buffer = self.read.as_mut().ok_or(NetworkError::Closed)?;
        buffer.clear();
        let n = src.read_buf(buffer).await?;
        if n == 0 {
            return Ok(0);
        }

        if let Some(chunk) = self.read.take() {
            let appended = self.append(&chunk[..n]);
            self.read = Some(chunk);
            appended?;
        }
        Ok(n)
    }

    /// Buffer bytes received from the peer
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.state == ReaderState::Closed {
            return Err(NetworkError::Closed);
        }
        self.compact();

        let needed = self.buffered() + data.len();
        if needed > self.capacity {
            let target = match self.state {
                ReaderState::AwaitBody { length } => {
                    needed.max(self.framing.length.size() + length)
                }
                _ => needed.max(self.capacity * 2),
            };
            self.grow(target);
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.extend_from_slice(data);
        }
        Ok(())
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// Any error leaves the reader closed; the stream cannot be resynchronized.
    pub fn next_packet<P: Protocol>(&mut self, protocol: &P) -> Result<Option<P::Packet>> {
        match self.decode(protocol) {
            Ok(packet) => Ok(packet),
            Err(e) => {
                self.state = ReaderState::Closed;
                Err(e)
            }
        }
    }

    fn decode<P: Protocol>(&mut self, protocol: &P) -> Result<Option<P::Packet>> {
        let length_size = self.framing.length.size();

        let length = match self.state {
            ReaderState::Closed => return Err(NetworkError::Closed),
            ReaderState::AwaitBody { length } => length,
            ReaderState::AwaitLength => {
                let Some(available) = self.available() else {
                    return Ok(None);
                };
                if available.len() < length_size {
                    return Ok(None);
                }
                let length = self.framing.length.read(available, self.framing.order) as usize;
                if length > self.framing.max_packet_size {
                    return Err(NetworkError::MessageTooLarge(
                        length,
                        self.framing.max_packet_size,
                    ));
                }
                if length < self.framing.id_size() {
                    return Err(NetworkError::codec(format!(
                        "frame length {} shorter than the id header",
                        length
                    )));
                }
                self.state = ReaderState::AwaitBody { length };
                length
            }
        };

        let frame_size = length_size + length;
        let Some(available) = self.available() else {
            return Ok(None);
        };
        if available.len() < frame_size {
            return Ok(None);
        }

        let frame = &available[length_size..frame_size];
        let id = self
            .framing
            .id
            .map(|width| width.read(frame, self.framing.order));
        let packet = protocol.read_packet(id, &frame[self.framing.id_size()..])?;

        self.pos += frame_size;
        self.state = ReaderState::AwaitLength;
        if self.oversized && self.buffered() <= self.pending_size {
            self.shrink();
        }
        Ok(Some(packet))
    }

    fn available(&self) -> Option<&[u8]> {
        self.pending.as_ref().map(|p| &p[self.pos..])
    }

    /// Move unconsumed bytes to the front of the pending buffer
    fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        if let Some(pending) = self.pending.as_mut() {
            let len = pending.len();
            pending.copy_within(self.pos..len, 0);
            pending.truncate(len - self.pos);
        }
        self.pos = 0;
    }

    fn grow(&mut self, size: usize) {
        let mut bigger = self.allocator.take_buffer(size);
        if let Some(old) = self.pending.take() {
            bigger.extend_from_slice(&old[self.pos..]);
            self.put_pending(old);
        }
        tracing::trace!(size, "pending buffer grown for large frame");
        self.pos = 0;
        self.capacity = bigger.capacity();
        self.pending = Some(bigger);
        self.oversized = true;
    }

    fn shrink(&mut self) {
        let mut regular = self.allocator.take_pending_buffer();
        if let Some(old) = self.pending.take() {
            regular.extend_from_slice(&old[self.pos..]);
            self.put_pending(old);
        }
        self.pos = 0;
        self.capacity = regular.capacity();
        self.pending = Some(regular);
        self.oversized = false;
    }

    fn put_pending(&self, buffer: BytesMut) {
        if self.oversized {
            self.allocator.put_buffer(buffer);
        } else {
            self.allocator.put_pending_buffer(buffer);
        }
    }

    /// Return all buffers to the allocator and close the reader.
    ///
    /// Safe to call more than once; buffers are handed back only the first time.
    pub fn release(&mut self) {
        self.state = ReaderState::Closed;
        if let Some(read) = self.read.take() {
            self.allocator.put_read_buffer(read);
        }
        if let Some(pending) = self.pending.take() {
            self.put_pending(pending);
        }
        self.pos = 0;
    }
}

impl Drop for PacketReader {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketReader")
            .field("state", &self.state)
            .field("buffered", &self.buffered())
            .field("oversized", &self.oversized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBufferAllocator;
    use crate::codec::framing::{ByteOrder, HeaderWidth};
    use crate::packet::tests::{test_registry, Chat, Ping, TestPacket};
    use crate::packet::{IdProtocol, RawPacket, RawProtocol};

    fn raw_framing(max: usize) -> Framing {
        Framing {
            length: HeaderWidth::Four,
            id: None,
            order: ByteOrder::BigEndian,
            max_packet_size: max,
        }
    }

    fn encode_raw(framing: &Framing, payload: &[u8]) -> BytesMut {
        let mut dst = BytesMut::new();
        framing
            .encode(&RawProtocol, &RawPacket::from(payload.to_vec()), &mut dst)
            .unwrap();
        dst
    }

    #[test]
    fn test_pipelined_frames_in_one_append() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
        let framing = raw_framing(1024);
        let mut reader = PacketReader::new(framing, allocator);

        let mut bytes = encode_raw(&framing, b"one");
        bytes.extend_from_slice(&encode_raw(&framing, b"two"));
        bytes.extend_from_slice(&encode_raw(&framing, b"three"));
        reader.append(&bytes).unwrap();

        let mut payloads = Vec::new();
        while let Some(packet) = reader.next_packet(&RawProtocol).unwrap() {
            payloads.push(packet.into_payload());
        }
        assert_eq!(payloads, vec!["one", "two", "three"]);
        assert_eq!(reader.buffered(), 0);
        assert_eq!(reader.state(), ReaderState::AwaitLength);
    }

    #[test]
    fn test_partial_header_and_body_wait_for_more_bytes() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
        let framing = raw_framing(1024);
        let mut reader = PacketReader::new(framing, allocator);
        let bytes = encode_raw(&framing, b"split payload");

        reader.append(&bytes[..2]).unwrap();
        assert!(reader.next_packet(&RawProtocol).unwrap().is_none());
        assert_eq!(reader.state(), ReaderState::AwaitLength);

        reader.append(&bytes[2..7]).unwrap();
        assert!(reader.next_packet(&RawProtocol).unwrap().is_none());
        assert_eq!(reader.state(), ReaderState::AwaitBody { length: 13 });

        reader.append(&bytes[7..]).unwrap();
        let packet = reader.next_packet(&RawProtocol).unwrap().unwrap();
        assert_eq!(packet.payload().as_ref(), b"split payload");
    }

    #[test]
    fn test_huge_declared_length_closes_reader() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(100, 100, 200));
        let framing = raw_framing(200);
        let mut reader = PacketReader::new(framing, allocator.clone());

        reader.append(&250_000_000u32.to_be_bytes()).unwrap();
        let err = reader.next_packet(&RawProtocol).unwrap_err();

        assert!(matches!(err, NetworkError::MessageTooLarge(250_000_000, 200)));
        assert!(reader.is_closed());
        assert!(reader.append(b"more").is_err());
        // nothing beyond the regular buffers was allocated
        assert_eq!(allocator.stats().allocated, 2);
    }

    #[test]
    fn test_id_frames_decode_through_registry() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
        let protocol = IdProtocol::new(test_registry());
        let framing = Framing {
            length: HeaderWidth::Two,
            id: Some(HeaderWidth::Two),
            order: ByteOrder::LittleEndian,
            max_packet_size: 1024,
        };
        let mut reader = PacketReader::new(framing, allocator);

        let mut dst = BytesMut::new();
        framing
            .encode(&protocol, &TestPacket::Ping(Ping { sequence: 9 }), &mut dst)
            .unwrap();
        reader.append(&dst).unwrap();
        framing
            .encode(&protocol, &Chat { text: "hey".into() }.into(), &mut dst)
            .unwrap();
        reader.append(&dst).unwrap();

        assert_eq!(
            reader.next_packet(&protocol).unwrap(),
            Some(TestPacket::Ping(Ping { sequence: 9 }))
        );
        assert_eq!(
            reader.next_packet(&protocol).unwrap(),
            Some(TestPacket::Chat(Chat { text: "hey".into() }))
        );
    }

    #[test]
    fn test_unknown_id_closes_reader() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
        let protocol = IdProtocol::new(test_registry());
        let framing = Framing {
            length: HeaderWidth::Two,
            id: Some(HeaderWidth::Two),
            order: ByteOrder::BigEndian,
            max_packet_size: 1024,
        };
        let mut reader = PacketReader::new(framing, allocator);

        // length 2, id 3, empty body
        reader.append(&[0x00, 0x02, 0x00, 0x03]).unwrap();
        assert!(matches!(
            reader.next_packet(&protocol),
            Err(NetworkError::UnknownPacketId(3))
        ));
        assert!(reader.is_closed());
    }

    #[test]
    fn test_large_frame_uses_oversized_buffer_then_shrinks() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
        let framing = raw_framing(64 * 1024);
        let mut reader = PacketReader::new(framing, allocator.clone());

        let payload = vec![7u8; 10_000];
        let bytes = encode_raw(&framing, &payload);
        for chunk in bytes.chunks(64) {
            reader.append(chunk).unwrap();
        }
        let tail = encode_raw(&framing, b"after");
        reader.append(&tail).unwrap();

        let packet = reader.next_packet(&RawProtocol).unwrap().unwrap();
        assert_eq!(packet.len(), 10_000);
        let after = reader.next_packet(&RawProtocol).unwrap().unwrap();
        assert_eq!(after.payload().as_ref(), b"after");

        reader.release();
        // read, regular pending and the oversized buffer all returned
        let stats = allocator.stats();
        assert_eq!(stats.returned, stats.allocated + stats.reused);
    }

    #[test]
    fn test_release_returns_buffers_once() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
        let mut reader = PacketReader::new(raw_framing(1024), allocator.clone());

        reader.release();
        reader.release();
        drop(reader);

        assert_eq!(allocator.stats().returned, 2);
        assert_eq!(allocator.pooled(), 2);
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let allocator = Arc::new(PooledBufferAllocator::with_sizes(8, 8, 16));
        let framing = raw_framing(1024);
        let mut reader = PacketReader::new(framing, allocator);
        let bytes = encode_raw(&framing, b"streamed through a small read buffer");
        let mut src: &[u8] = &bytes;

        let mut packet = None;
        while packet.is_none() {
            let n = reader.read_from(&mut src).await.unwrap();
            assert!(n > 0);
            packet = reader.next_packet(&RawProtocol).unwrap();
        }
        assert_eq!(
            packet.unwrap().payload().as_ref(),
            b"streamed through a small read buffer"
        );
        assert_eq!(reader.read_from(&mut src).await.unwrap(), 0);
    }
}
