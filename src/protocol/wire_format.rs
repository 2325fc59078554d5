//! Wire format encoding and decoding.
//!
//! Implements the 4-byte frame header:
//! ```text
//! ┌────────────┬────────────┬─────────────────┐
//! │ total_size │  type_id   │     payload     │
//! │ 2 bytes    │ 2 bytes    │ total_size − 4  │
//! │ uint16 LE  │ uint16 LE  │     binary      │
//! └────────────┴────────────┴─────────────────┘
//! ```
//!
//! `total_size` includes the header, so a legal frame satisfies
//! `4 <= total_size <= 65535`.

use crate::error::{FramewireError, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Largest legal frame including the header.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Largest legal payload.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size in bytes, header included.
    pub total_size: u16,
    /// Protocol position of the payload's message type.
    pub type_id: u16,
}

impl FrameHeader {
    /// Builds a header for a payload of `payload_len` bytes.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` when the frame would not fit the 16-bit size field.
    pub fn for_payload(type_id: u16, payload_len: usize) -> Result<Self> {
        let total = HEADER_SIZE + payload_len;
        if total > MAX_FRAME_SIZE {
            return Err(FramewireError::FrameTooLarge { size: total });
        }
        Ok(Self {
            total_size: total as u16,
            type_id,
        })
    }

    /// Encodes the header to its little-endian wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.total_size.to_le_bytes());
        buf[2..4].copy_from_slice(&self.type_id.to_le_bytes());
        buf
    }

    /// Decodes a header from the front of `buf`.
    ///
    /// Returns `None` if the buffer is shorter than a header.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            total_size: u16::from_le_bytes([buf[0], buf[1]]),
            type_id: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    /// Payload length implied by `total_size`.
    pub fn payload_len(&self) -> usize {
        (self.total_size as usize).saturating_sub(HEADER_SIZE)
    }
}

/// Result of inspecting the front of a read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FramePeek {
    /// Not enough bytes for a header, or for the announced frame.
    NeedMore,
    /// A complete frame starts at offset zero.
    Frame { type_id: u16, total_size: usize },
    /// The header announces an impossible size; the connection must close.
    Malformed { total_size: usize },
}

/// Inspects the front of the read buffer for one complete frame.
pub fn peek_frame(buf: &[u8]) -> FramePeek {
    let header = match FrameHeader::decode(buf) {
        Some(h) => h,
        None => return FramePeek::NeedMore,
    };
    let total = header.total_size as usize;
    if total < HEADER_SIZE {
        return FramePeek::Malformed { total_size: total };
    }
    if buf.len() < total {
        return FramePeek::NeedMore;
    }
    FramePeek::Frame {
        type_id: header.type_id,
        total_size: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = FrameHeader::for_payload(7, 100).unwrap();
        let encoded = original.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(decoded.payload_len(), 100);
    }

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = FrameHeader {
            total_size: 0x0102,
            type_id: 0x0304,
        };
        let bytes = header.encode();

        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(bytes[2], 0x04);
        assert_eq!(bytes[3], 0x03);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(FrameHeader::decode(&[0u8; 3]).is_none());
    }

    #[test]
    fn test_for_payload_rejects_oversize() {
        assert!(FrameHeader::for_payload(1, MAX_PAYLOAD_SIZE).is_ok());
        let err = FrameHeader::for_payload(1, MAX_PAYLOAD_SIZE + 1).unwrap_err();
        assert!(matches!(
            err,
            crate::error::FramewireError::FrameTooLarge { size: 65536 }
        ));
    }

    #[test]
    fn test_empty_payload_frame() {
        let header = FrameHeader::for_payload(3, 0).unwrap();
        assert_eq!(header.total_size, 4);
        assert_eq!(header.payload_len(), 0);
    }

    #[test]
    fn test_peek_needs_header() {
        assert_eq!(peek_frame(&[5, 0]), FramePeek::NeedMore);
    }

    #[test]
    fn test_peek_needs_payload() {
        // Announces 10 bytes total, only the header has arrived.
        let header = FrameHeader {
            total_size: 10,
            type_id: 2,
        };
        assert_eq!(peek_frame(&header.encode()), FramePeek::NeedMore);
    }

    #[test]
    fn test_peek_complete_frame() {
        let mut wire = FrameHeader::for_payload(2, 3).unwrap().encode().to_vec();
        wire.extend_from_slice(b"abc");
        wire.extend_from_slice(b"trailing");

        assert_eq!(
            peek_frame(&wire),
            FramePeek::Frame {
                type_id: 2,
                total_size: 7
            }
        );
    }

    #[test]
    fn test_peek_rejects_undersized_total() {
        // total_size of 3 can never hold its own header.
        let bad = [3u8, 0, 1, 0, 0xFF];
        assert_eq!(peek_frame(&bad), FramePeek::Malformed { total_size: 3 });
    }
}
