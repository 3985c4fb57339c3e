//! Property-based tests for framing using proptest

use bytes::BytesMut;
use proptest::prelude::*;
use rust_packet_network::*;
use std::sync::Arc;

fn framing(length: HeaderWidth, order: ByteOrder, max_packet_size: usize) -> Framing {
    Framing {
        length,
        id: None,
        order,
        max_packet_size,
    }
}

fn header_width() -> impl Strategy<Value = HeaderWidth> {
    prop_oneof![
        Just(HeaderWidth::One),
        Just(HeaderWidth::Two),
        Just(HeaderWidth::Four),
    ]
}

fn byte_order() -> impl Strategy<Value = ByteOrder> {
    prop_oneof![Just(ByteOrder::BigEndian), Just(ByteOrder::LittleEndian)]
}

fn reader(framing: Framing) -> PacketReader {
    let allocator: Arc<dyn BufferAllocator> =
        Arc::new(PooledBufferAllocator::with_sizes(64, 64, 128));
    PacketReader::new(framing, allocator)
}

/// Encode `payloads` back to back into one byte stream
fn wire(framing: &Framing, payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut stream = Vec::new();
    let mut frame = BytesMut::new();
    for payload in payloads {
        framing
            .encode(&RawProtocol, &RawPacket::from(payload.clone()), &mut frame)
            .unwrap();
        stream.extend_from_slice(&frame);
    }
    stream
}

// ============================================================================
// Chunking Invariance
// ============================================================================

proptest! {
    /// However the byte stream is split, the same packets come out in order
    #[test]
    fn test_packets_survive_arbitrary_chunking(
        length in header_width(),
        order in byte_order(),
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..20),
        cuts in prop::collection::vec(1usize..300, 1..40),
    ) {
        let framing = framing(length, order, length.max_value().min(1 << 20) as usize);
        let payloads: Vec<Vec<u8>> = payloads
            .into_iter()
            .map(|mut p| {
                p.truncate(framing.max_packet_size);
                p
            })
            .collect();
        let stream = wire(&framing, &payloads);

        let mut reader = reader(framing);
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();
        while offset < stream.len() {
            let end = (offset + cut.next().copied().unwrap_or(1)).min(stream.len());
            reader.append(&stream[offset..end]).unwrap();
            while let Some(packet) = reader.next_packet(&RawProtocol).unwrap() {
                decoded.push(packet.payload().to_vec());
            }
            offset = end;
        }

        prop_assert_eq!(decoded, payloads);
        prop_assert_eq!(reader.buffered(), 0);
        prop_assert_eq!(reader.state(), ReaderState::AwaitLength);
    }

    /// A prefix of a frame never yields a packet
    #[test]
    fn test_truncated_frame_waits_for_more(
        payload in prop::collection::vec(any::<u8>(), 1..500),
        keep in 0usize..500,
    ) {
        let framing = framing(HeaderWidth::Four, ByteOrder::BigEndian, 1 << 20);
        let stream = wire(&framing, &[payload]);
        let keep = keep.min(stream.len() - 1);

        let mut reader = reader(framing);
        reader.append(&stream[..keep]).unwrap();
        prop_assert!(reader.next_packet(&RawProtocol).unwrap().is_none());
        prop_assert!(!reader.is_closed());
    }
}

// ============================================================================
// Safety Ceiling
// ============================================================================

proptest! {
    /// Any declared length above the ceiling closes the reader
    #[test]
    fn test_length_above_ceiling_is_rejected(
        ceiling in 1usize..10_000,
        excess in 1u32..1_000_000,
    ) {
        let framing = framing(HeaderWidth::Four, ByteOrder::BigEndian, ceiling);
        let declared = ceiling as u32 + excess;

        let mut reader = reader(framing);
        reader.append(&declared.to_be_bytes()).unwrap();
        let result = reader.next_packet(&RawProtocol);
        prop_assert!(
            matches!(result, Err(NetworkError::MessageTooLarge(_, _))),
            "expected MessageTooLarge, got {:?}",
            result
        );
        prop_assert!(reader.is_closed());
    }

    /// Encoding refuses bodies the ceiling would reject on the other side
    #[test]
    fn test_encode_respects_ceiling(
        ceiling in 1usize..2_000,
        size in 0usize..4_000,
    ) {
        let framing = framing(HeaderWidth::Four, ByteOrder::BigEndian, ceiling);
        let mut frame = BytesMut::new();
        let result = framing.encode(&RawProtocol, &RawPacket::from(vec![0u8; size]), &mut frame);
        if size <= ceiling {
            prop_assert!(result.is_ok());
            prop_assert_eq!(frame.len(), size + 4);
        } else {
            prop_assert!(result.is_err());
        }
    }
}
