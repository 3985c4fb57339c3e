//! Wire layout of a frame
//!
//! ```text
//! [length: 1|2|4 bytes][id: 1|2|4 bytes, id-framed only][body]
//! ```
//!
//! `length` covers the id header (if present) plus the body, never itself.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::core::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::packet::Protocol;

/// Byte order used for length and id headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// Width of a numeric frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderWidth {
    One,
    Two,
    Four,
}

impl HeaderWidth {
    /// Number of bytes the header occupies
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    /// Largest value the header can carry
    #[must_use]
    pub const fn max_value(self) -> u32 {
        match self {
            Self::One => u8::MAX as u32,
            Self::Two => u16::MAX as u32,
            Self::Four => u32::MAX,
        }
    }

    /// Build a width from a byte count
    pub fn from_size(size: usize) -> Result<Self> {
        match size {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            other => Err(NetworkError::config(format!(
                "header width must be 1, 2 or 4 bytes, got {}",
                other
            ))),
        }
    }

    /// Decode a header value from the first `size()` bytes of `src`.
    ///
    /// The caller guarantees `src.len() >= self.size()`.
    #[must_use]
    pub fn read(self, src: &[u8], order: ByteOrder) -> u32 {
        match (self, order) {
            (Self::One, _) => u32::from(src[0]),
            (Self::Two, ByteOrder::BigEndian) => u32::from(u16::from_be_bytes([src[0], src[1]])),
            (Self::Two, ByteOrder::LittleEndian) => {
                u32::from(u16::from_le_bytes([src[0], src[1]]))
            }
            (Self::Four, ByteOrder::BigEndian) => {
                u32::from_be_bytes([src[0], src[1], src[2], src[3]])
            }
            (Self::Four, ByteOrder::LittleEndian) => {
                u32::from_le_bytes([src[0], src[1], src[2], src[3]])
            }
        }
    }

    /// Encode `value` into the first `size()` bytes of `dst`.
    pub fn write(self, dst: &mut [u8], value: u32, order: ByteOrder) -> Result<()> {
        if value > self.max_value() {
            return Err(NetworkError::codec(format!(
                "value {} does not fit in a {}-byte header",
                value,
                self.size()
            )));
        }
        match (self, order) {
            (Self::One, _) => dst[0] = value as u8,
            (Self::Two, ByteOrder::BigEndian) => {
                dst[..2].copy_from_slice(&(value as u16).to_be_bytes())
            }
            (Self::Two, ByteOrder::LittleEndian) => {
                dst[..2].copy_from_slice(&(value as u16).to_le_bytes())
            }
            (Self::Four, ByteOrder::BigEndian) => dst[..4].copy_from_slice(&value.to_be_bytes()),
            (Self::Four, ByteOrder::LittleEndian) => dst[..4].copy_from_slice(&value.to_le_bytes()),
        }
        Ok(())
    }
}

/// Header layout shared by one connection's reader and writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    /// Length header width
    pub length: HeaderWidth,
    /// Id header width, `None` for length-only framing
    pub id: Option<HeaderWidth>,
    /// Header byte order
    pub order: ByteOrder,
    /// Largest accepted value of the length header
    pub max_packet_size: usize,
}

impl Framing {
    /// Derive the framing for `protocol` from connection tuning.
    #[must_use]
    pub fn for_protocol<P: Protocol>(config: &NetworkConfig, protocol: &P) -> Self {
        Self {
            length: config.length_header,
            id: protocol.is_id_framed().then_some(config.id_header),
            order: config.byte_order,
            max_packet_size: config.effective_max_packet_size(),
        }
    }

    /// Bytes occupied by the id header
    #[must_use]
    pub fn id_size(&self) -> usize {
        self.id.map_or(0, HeaderWidth::size)
    }

    /// Bytes occupied by all headers
    #[must_use]
    pub fn header_size(&self) -> usize {
        self.length.size() + self.id_size()
    }

    /// Serialize one packet into `dst` as a complete frame.
    ///
    /// Header space is reserved first, the body is written by the protocol,
    /// then the length header is backfilled now that the body size is known.
    pub fn encode<P: Protocol>(
        &self,
        protocol: &P,
        packet: &P::Packet,
        dst: &mut BytesMut,
    ) -> Result<()> {
        dst.clear();
        let header = self.header_size();
        dst.put_bytes(0, header);

        protocol.write_packet(packet, dst)?;

        let length = dst.len() - self.length.size();
        if length > self.max_packet_size {
            dst.clear();
            return Err(NetworkError::MessageTooLarge(length, self.max_packet_size));
        }

        let (length_header, rest) = dst.split_at_mut(self.length.size());
        self.length.write(length_header, length as u32, self.order)?;
        if let Some(id_width) = self.id {
            let id = protocol.packet_id(packet);
            if let Err(e) = id_width.write(&mut rest[..id_width.size()], id, self.order) {
                dst.clear();
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{RawPacket, RawProtocol};

    #[test]
    fn test_header_width_round_trip_both_orders() {
        let mut buf = [0u8; 4];
        for order in [ByteOrder::BigEndian, ByteOrder::LittleEndian] {
            HeaderWidth::Two.write(&mut buf, 0x1234, order).unwrap();
            assert_eq!(HeaderWidth::Two.read(&buf, order), 0x1234);
            HeaderWidth::Four.write(&mut buf, 0xDEAD_BEEF, order).unwrap();
            assert_eq!(HeaderWidth::Four.read(&buf, order), 0xDEAD_BEEF);
        }

        HeaderWidth::Two.write(&mut buf, 0x0102, ByteOrder::BigEndian).unwrap();
        assert_eq!(&buf[..2], &[0x01, 0x02]);
        HeaderWidth::Two.write(&mut buf, 0x0102, ByteOrder::LittleEndian).unwrap();
        assert_eq!(&buf[..2], &[0x02, 0x01]);
    }

    #[test]
    fn test_header_width_rejects_overflow() {
        let mut buf = [0u8; 1];
        assert!(HeaderWidth::One.write(&mut buf, 256, ByteOrder::BigEndian).is_err());
        assert!(HeaderWidth::from_size(3).is_err());
        assert_eq!(HeaderWidth::from_size(2).unwrap(), HeaderWidth::Two);
    }

    #[test]
    fn test_encode_backfills_length() {
        let framing = Framing {
            length: HeaderWidth::Two,
            id: None,
            order: ByteOrder::BigEndian,
            max_packet_size: 1024,
        };
        let mut dst = BytesMut::with_capacity(64);
        framing
            .encode(&RawProtocol, &RawPacket::from("hello"), &mut dst)
            .unwrap();

        assert_eq!(&dst[..], &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_rejects_body_over_ceiling() {
        let framing = Framing {
            length: HeaderWidth::Four,
            id: None,
            order: ByteOrder::BigEndian,
            max_packet_size: 4,
        };
        let mut dst = BytesMut::new();
        let err = framing
            .encode(&RawProtocol, &RawPacket::from("too long"), &mut dst)
            .unwrap_err();

        assert!(matches!(err, NetworkError::MessageTooLarge(8, 4)));
        assert!(dst.is_empty());
    }
}
