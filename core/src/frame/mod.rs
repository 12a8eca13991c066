//! Frame codec for the short-range link.
//!
//! Every frame starts with a single header byte:
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! +---------------+-------+---+---+
//! |     type      |   -   | L | D |
//! +---------------+-------+---+---+
//! ```
//!
//! `D` marks a direct (single hop, session bound) frame and `L` marks the last
//! fragment of a stream. Depending on the type a fixed sub-header follows,
//! see [`header`].

pub mod header;

pub use header::{ack_frames, parse_ack_ids, BroadcastHeader, RelayHeader};

use thiserror::Error;

/// Bit set on frames delivered over a single session-bound hop.
const DIRECT_BIT: u8 = 0b0000_0001;
/// Bit set on the final fragment of a stream.
const LAST_BIT: u8 = 0b0000_0010;
const TYPE_SHIFT: u8 = 4;

/// Frame kinds carried in the high nibble of the header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Anything we do not understand (0x0)
    Unknown = 0x0,
    /// Handshake request from the connecting side (0x1)
    HandshakeRequest = 0x1,
    /// Handshake response from the accepting side (0x2)
    HandshakeResponse = 0x2,
    /// Unicast message, direct or relayed (0x3)
    Message = 0x3,
    /// TTL bounded flood (0x4)
    Broadcast = 0x4,
    /// Packed acknowledgment ids (0x5)
    Acknowledgment = 0x5,
}

impl FrameType {
    /// Convert from the 4-bit type value. Unassigned values map to `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x1 => FrameType::HandshakeRequest,
            0x2 => FrameType::HandshakeResponse,
            0x3 => FrameType::Message,
            0x4 => FrameType::Broadcast,
            0x5 => FrameType::Acknowledgment,
            _ => FrameType::Unknown,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Size of the header (type byte included) for non-direct frames.
    pub fn header_size(&self) -> usize {
        match self {
            FrameType::Unknown => 0,
            FrameType::HandshakeRequest | FrameType::HandshakeResponse => 1,
            FrameType::Message => RelayHeader::SIZE + 1,
            FrameType::Broadcast => BroadcastHeader::SIZE + 1,
            FrameType::Acknowledgment => 1,
        }
    }

    /// Handshake frames travel in the clear even once a session exists.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            FrameType::HandshakeRequest | FrameType::HandshakeResponse
        )
    }
}

/// Frame codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("Unexpected frame type: {0:?}")]
    UnexpectedType(FrameType),

    #[error("Stream needs {0} fragments, more than a sequence number can address")]
    TooManyFragments(usize),

    #[error("Payload size {0} leaves no room for frame data")]
    PayloadSizeTooSmall(usize),
}

/// Build the header byte for a frame.
pub fn encode_header(frame_type: FrameType, is_direct: bool, is_last: bool) -> u8 {
    let mut byte = frame_type.as_u8() << TYPE_SHIFT;
    if is_direct {
        byte |= DIRECT_BIT;
    }
    if is_last {
        byte |= LAST_BIT;
    }
    byte
}

/// Type of a frame. An empty buffer is `Unknown`.
pub fn decode_type(frame: &[u8]) -> FrameType {
    frame
        .first()
        .map(|b| FrameType::from_u8(b >> TYPE_SHIFT))
        .unwrap_or(FrameType::Unknown)
}

pub fn is_direct(frame: &[u8]) -> bool {
    frame.first().map(|b| b & DIRECT_BIT != 0).unwrap_or(false)
}

pub fn is_last(frame: &[u8]) -> bool {
    frame.first().map(|b| b & LAST_BIT != 0).unwrap_or(false)
}

/// Header size for a frame kind.
///
/// Direct frames carry no sub-header and always report the size of a
/// handshake request header, whatever their type.
pub fn header_size(frame_type: FrameType, is_direct: bool) -> usize {
    if is_direct {
        FrameType::HandshakeRequest.header_size()
    } else {
        frame_type.header_size()
    }
}

/// Header size of an encoded frame, read from its first byte.
pub fn frame_header_size(frame: &[u8]) -> usize {
    header_size(decode_type(frame), is_direct(frame))
}

/// Frame contents after the computed header. Truncated frames yield an
/// empty slice.
pub fn payload(frame: &[u8]) -> &[u8] {
    let size = frame_header_size(frame);
    frame.get(size..).unwrap_or(&[])
}

/// Split `stream` into chunks that fit in frames of `payload_size` bytes
/// once a header of `header_len` bytes is prepended.
///
/// Always yields at least one chunk so an empty stream still produces a
/// terminating frame.
pub(crate) fn chunk_stream(
    stream: &[u8],
    payload_size: usize,
    header_len: usize,
) -> Result<Vec<&[u8]>, FrameError> {
    let room = payload_size
        .checked_sub(header_len)
        .filter(|room| *room > 0)
        .ok_or(FrameError::PayloadSizeTooSmall(payload_size))?;
    if stream.is_empty() {
        return Ok(vec![stream]);
    }
    Ok(stream.chunks(room).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_TYPES: [FrameType; 6] = [
        FrameType::Unknown,
        FrameType::HandshakeRequest,
        FrameType::HandshakeResponse,
        FrameType::Message,
        FrameType::Broadcast,
        FrameType::Acknowledgment,
    ];

    #[test]
    fn test_header_bit_layout() {
        assert_eq!(encode_header(FrameType::Message, true, false), 0x31);
        assert_eq!(encode_header(FrameType::Message, false, true), 0x32);
        assert_eq!(encode_header(FrameType::Broadcast, false, false), 0x40);
        assert_eq!(encode_header(FrameType::Acknowledgment, false, true), 0x52);
    }

    #[test]
    fn test_header_roundtrip_all_combinations() {
        for ty in ALL_TYPES {
            for direct in [false, true] {
                for last in [false, true] {
                    let frame = [encode_header(ty, direct, last)];
                    assert_eq!(decode_type(&frame), ty);
                    assert_eq!(is_direct(&frame), direct);
                    assert_eq!(is_last(&frame), last);
                }
            }
        }
    }

    #[test]
    fn test_empty_frame_is_unknown() {
        assert_eq!(decode_type(&[]), FrameType::Unknown);
        assert!(!is_direct(&[]));
        assert!(!is_last(&[]));
        assert!(payload(&[]).is_empty());
    }

    #[test]
    fn test_unassigned_type_is_unknown() {
        assert_eq!(decode_type(&[0xF0]), FrameType::Unknown);
        assert_eq!(decode_type(&[0x60]), FrameType::Unknown);
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(header_size(FrameType::Unknown, false), 0);
        assert_eq!(header_size(FrameType::HandshakeRequest, false), 1);
        assert_eq!(header_size(FrameType::HandshakeResponse, false), 1);
        assert_eq!(header_size(FrameType::Message, false), 11);
        assert_eq!(header_size(FrameType::Broadcast, false), 8);
        assert_eq!(header_size(FrameType::Acknowledgment, false), 1);
    }

    #[test]
    fn test_direct_header_size_ignores_type() {
        for ty in ALL_TYPES {
            assert_eq!(header_size(ty, true), 1);
        }
    }

    #[test]
    fn test_payload_strips_relay_header() {
        let mut frame = vec![encode_header(FrameType::Message, false, true)];
        frame.extend_from_slice(&[0u8; 10]);
        frame.extend_from_slice(b"body");
        assert_eq!(payload(&frame), b"body");
    }

    #[test]
    fn test_truncated_frame_has_empty_payload() {
        let frame = [encode_header(FrameType::Broadcast, false, false), 1, 2];
        assert!(payload(&frame).is_empty());
    }

    #[test]
    fn test_chunk_stream_rejects_tiny_payload() {
        assert_eq!(
            chunk_stream(b"abc", 11, 11),
            Err(FrameError::PayloadSizeTooSmall(11))
        );
    }

    #[test]
    fn test_chunk_stream_empty_yields_one_chunk() {
        let chunks = chunk_stream(b"", 100, 1).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    proptest! {
        #[test]
        fn prop_payload_after_header(
            ty in 0u8..6,
            direct in any::<bool>(),
            last in any::<bool>(),
            body in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let ty = FrameType::from_u8(ty);
            let mut frame = vec![encode_header(ty, direct, last)];
            let extra = header_size(ty, direct).saturating_sub(1);
            frame.extend(std::iter::repeat(0u8).take(extra));
            frame.extend_from_slice(&body);
            if ty == FrameType::Unknown && !direct {
                prop_assert_eq!(payload(&frame).len(), body.len() + 1);
            } else {
                prop_assert_eq!(payload(&frame), body.as_slice());
            }
        }
    }
}
