//! Message framing.
//!
//! Each message moves through the ring as one fixed-size header record
//! pointing into the payload area. The record is little-endian on the
//! wire; the length field occupies a platform-word slot (signed, as the
//! legacy peers wrote it), so the record is 16 bytes on 64-bit targets.

/// Size of one encoded header record in the ring.
pub const HEADER_RECORD_SIZE: usize = 16;

/// Header record for one message.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Identity of the sending peer, validated by the consumer.
    pub source_id: u32,
    /// Byte offset of the payload inside the payload area.
    pub payload_offset: u32,
    /// Payload length in bytes. Signed platform word on the wire.
    pub payload_length: i64,
}

const _: () = assert!(core::mem::size_of::<MessageHeader>() == HEADER_RECORD_SIZE);

impl MessageHeader {
    /// Encode to the little-endian wire record.
    pub fn encode(&self) -> [u8; HEADER_RECORD_SIZE] {
        let mut out = [0u8; HEADER_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.source_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.payload_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.payload_length.to_le_bytes());
        out
    }

    /// Decode from the little-endian wire record.
    pub fn decode(record: &[u8; HEADER_RECORD_SIZE]) -> Self {
        Self {
            source_id: u32::from_le_bytes(record[0..4].try_into().unwrap()),
            payload_offset: u32::from_le_bytes(record[4..8].try_into().unwrap()),
            payload_length: i64::from_le_bytes(record[8..16].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = MessageHeader {
            source_id: 1,
            payload_offset: 4096,
            payload_length: 1234,
        };
        assert_eq!(MessageHeader::decode(&header.encode()), header);
    }

    #[test]
    fn wire_bytes_are_little_endian() {
        let header = MessageHeader {
            source_id: 0x0102_0304,
            payload_offset: 0x0A0B_0C0D,
            payload_length: 0x11,
        };
        let record = header.encode();
        assert_eq!(&record[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&record[4..8], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&record[8..16], &[0x11, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn negative_length_survives_decode() {
        let header = MessageHeader {
            source_id: 9,
            payload_offset: 0,
            payload_length: -1,
        };
        let decoded = MessageHeader::decode(&header.encode());
        assert_eq!(decoded.payload_length, -1);
    }
}
