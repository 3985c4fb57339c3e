//! Packet types and wire protocols
//!
//! A [`Protocol`] turns frame bodies into packets and back. Two protocols are
//! provided: [`RawProtocol`] frames opaque payloads with a length header only,
//! [`IdProtocol`] adds a type-id header resolved through a [`PacketRegistry`].

pub mod registry;

pub use registry::{PacketPrototype, PacketRegistry, MAX_PACKET_ID};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

use crate::error::{NetworkError, Result};

/// A packet that can serialize its body
pub trait WritablePacket {
    /// Append the body to `dst`
    fn write(&self, dst: &mut BytesMut) -> Result<()>;

    /// Body size if known up front, enabling single-pass serialization
    fn expected_length(&self) -> Option<usize> {
        None
    }
}

/// A packet that can fill itself from a frame body
pub trait ReadablePacket {
    /// Decode the body; `body` holds exactly one frame's payload.
    fn read(&mut self, body: &mut &[u8]) -> Result<()>;
}

/// Static identity of an id-framed packet type
pub trait PacketDescriptor {
    /// Wire id
    const ID: u32;
    /// Name used in diagnostics
    const NAME: &'static str;
}

/// Outbound id-framed packet
pub trait IdPacket: WritablePacket + Clone + Send + Sync + 'static {
    /// Wire id of this packet
    fn packet_id(&self) -> u32;
}

/// Fail with a codec error unless `body` holds at least `needed` more bytes.
pub fn ensure_remaining(body: &[u8], needed: usize) -> Result<()> {
    if body.len() < needed {
        return Err(NetworkError::codec(format!(
            "truncated body: needed {} more bytes, {} remaining",
            needed,
            body.len()
        )));
    }
    Ok(())
}

/// Pluggable body codec driven by the packet reader and writer
pub trait Protocol: Send + Sync + 'static {
    /// Packet exchanged over connections speaking this protocol
    type Packet: Clone + Send + Sync + 'static;

    /// Whether frames carry a type-id header after the length header
    fn is_id_framed(&self) -> bool;

    /// Id written into the id header; ignored for length-only framing
    fn packet_id(&self, _packet: &Self::Packet) -> u32 {
        0
    }

    /// Body size if known before serialization
    fn expected_length(&self, _packet: &Self::Packet) -> Option<usize> {
        None
    }

    /// Largest type id that may appear in an id header
    fn max_packet_id(&self) -> Option<u32> {
        None
    }

    /// Append the body of `packet` to `dst`
    fn write_packet(&self, packet: &Self::Packet, dst: &mut BytesMut) -> Result<()>;

    /// Decode one frame body
    fn read_packet(&self, id: Option<u32>, body: &[u8]) -> Result<Self::Packet>;
}

/// Opaque length-framed payload
#[derive(Clone, PartialEq, Eq)]
pub struct RawPacket {
    payload: Bytes,
}

impl RawPacket {
    /// Create a packet from bytes
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Packet payload
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Take the payload
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl fmt::Debug for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPacket[{} bytes]", self.payload.len())
    }
}

impl From<&str> for RawPacket {
    fn from(s: &str) -> Self {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for RawPacket {
    fn from(s: String) -> Self {
        Self::new(Bytes::from(s))
    }
}

impl From<Vec<u8>> for RawPacket {
    fn from(v: Vec<u8>) -> Self {
        Self::new(Bytes::from(v))
    }
}

impl WritablePacket for RawPacket {
    fn write(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(&self.payload);
        Ok(())
    }

    fn expected_length(&self) -> Option<usize> {
        Some(self.payload.len())
    }
}

impl ReadablePacket for RawPacket {
    fn read(&mut self, body: &mut &[u8]) -> Result<()> {
        self.payload = body.copy_to_bytes(body.remaining());
        Ok(())
    }
}

/// Length-only framing of [`RawPacket`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RawProtocol;

impl Protocol for RawProtocol {
    type Packet = RawPacket;

    fn is_id_framed(&self) -> bool {
        false
    }

    fn expected_length(&self, packet: &RawPacket) -> Option<usize> {
        packet.expected_length()
    }

    fn write_packet(&self, packet: &RawPacket, dst: &mut BytesMut) -> Result<()> {
        packet.write(dst)
    }

    fn read_packet(&self, _id: Option<u32>, body: &[u8]) -> Result<RawPacket> {
        Ok(RawPacket::new(Bytes::copy_from_slice(body)))
    }
}

/// Length plus type-id framing; bodies decode through a [`PacketRegistry`].
pub struct IdProtocol<P> {
    registry: Arc<PacketRegistry<P>>,
}

impl<P: IdPacket> IdProtocol<P> {
    /// Create the protocol over a finished registry.
    ///
    /// Id header width is a network setting; `ClientNetwork::new` and
    /// `ServerNetwork::new` reject a registry whose ids do not fit it.
    pub fn new(registry: impl Into<Arc<PacketRegistry<P>>>) -> Self {
        Self {
            registry: registry.into(),
        }
    }

    /// The registry used for decoding
    #[must_use]
    pub fn registry(&self) -> &Arc<PacketRegistry<P>> {
        &self.registry
    }
}

impl<P: IdPacket> Protocol for IdProtocol<P> {
    type Packet = P;

    fn is_id_framed(&self) -> bool {
        true
    }

    fn packet_id(&self, packet: &P) -> u32 {
        packet.packet_id()
    }

    fn expected_length(&self, packet: &P) -> Option<usize> {
        packet.expected_length()
    }

    fn max_packet_id(&self) -> Option<u32> {
        self.registry.ids().max()
    }

    fn write_packet(&self, packet: &P, dst: &mut BytesMut) -> Result<()> {
        packet.write(dst)
    }

    fn read_packet(&self, id: Option<u32>, body: &[u8]) -> Result<P> {
        let id = id.ok_or_else(|| NetworkError::codec("id-framed packet without id header"))?;
        self.registry.resolve_prototype_by_id(id)?.new_instance(body)
    }
}

impl<P> fmt::Debug for IdProtocol<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdProtocol")
            .field("packets", &self.registry.len())
            .finish()
    }
}
