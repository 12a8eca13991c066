//! Typed sub-headers following the header byte.
//!
//! All integers are big-endian.
//!
//! ```text
//! relay:     [hdr][message_id:4][seq:2][receiver:4][data...]
//! broadcast: [hdr][message_id:4][seq:2][ttl:1][data...]
//! ack:       [hdr][id:4][id:4]...
//! ```

use super::{decode_type, encode_header, is_direct, is_last, FrameError, FrameType};
use crate::{MessageId, UserId};

fn ensure_len(frame: &[u8], need: usize) -> Result<(), FrameError> {
    if frame.len() < need {
        return Err(FrameError::BufferTooShort {
            need,
            got: frame.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Sub-header of a relayed (multi hop, addressed) message fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHeader {
    pub message_id: MessageId,
    /// 1-based fragment index
    pub seq: u16,
    pub receiver: UserId,
    pub is_last: bool,
}

impl RelayHeader {
    /// Sub-header size, header byte excluded
    pub const SIZE: usize = 10;

    /// Append header byte and sub-header to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(encode_header(FrameType::Message, false, self.is_last));
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.receiver.to_be_bytes());
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        let ty = decode_type(frame);
        if ty != FrameType::Message || is_direct(frame) {
            return Err(FrameError::UnexpectedType(ty));
        }
        ensure_len(frame, Self::SIZE + 1)?;
        Ok(Self {
            message_id: read_u32(&frame[1..5]),
            seq: u16::from_be_bytes([frame[5], frame[6]]),
            receiver: read_u32(&frame[7..11]),
            is_last: is_last(frame),
        })
    }
}

/// Sub-header of a broadcast fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastHeader {
    pub message_id: MessageId,
    /// 1-based fragment index
    pub seq: u16,
    pub ttl: u8,
    pub is_last: bool,
}

impl BroadcastHeader {
    /// Sub-header size, header byte excluded
    pub const SIZE: usize = 7;
    const TTL_OFFSET: usize = 7;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(encode_header(FrameType::Broadcast, false, self.is_last));
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.push(self.ttl);
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        let ty = decode_type(frame);
        if ty != FrameType::Broadcast {
            return Err(FrameError::UnexpectedType(ty));
        }
        ensure_len(frame, Self::SIZE + 1)?;
        Ok(Self {
            message_id: read_u32(&frame[1..5]),
            seq: u16::from_be_bytes([frame[5], frame[6]]),
            ttl: frame[Self::TTL_OFFSET],
            is_last: is_last(frame),
        })
    }

    /// Copy of `frame` with only the ttl byte replaced.
    pub fn rewrite_ttl(frame: &[u8], ttl: u8) -> Result<Vec<u8>, FrameError> {
        Self::parse(frame)?;
        let mut out = frame.to_vec();
        out[Self::TTL_OFFSET] = ttl;
        Ok(out)
    }
}

/// Pack acknowledgment ids into as few frames as `payload_size` allows.
pub fn ack_frames(ids: &[MessageId], payload_size: usize) -> Vec<Vec<u8>> {
    let per_frame = (payload_size.saturating_sub(1) / 4).max(1);
    let chunks: Vec<&[MessageId]> = ids.chunks(per_frame).collect();
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut frame = Vec::with_capacity(1 + chunk.len() * 4);
            frame.push(encode_header(
                FrameType::Acknowledgment,
                false,
                i + 1 == count,
            ));
            for id in chunk {
                frame.extend_from_slice(&id.to_be_bytes());
            }
            frame
        })
        .collect()
}

/// Ids packed in an acknowledgment frame. A trailing partial id is ignored.
pub fn parse_ack_ids(frame: &[u8]) -> Result<Vec<MessageId>, FrameError> {
    let ty = decode_type(frame);
    if ty != FrameType::Acknowledgment {
        return Err(FrameError::UnexpectedType(ty));
    }
    Ok(frame[1..].chunks_exact(4).map(read_u32).collect())
}
