//! Message ⇄ frame stream conversion.
//!
//! Send side:
//!
//! ```text
//! body     = len:4 BE ‖ header JSON ‖ data
//! stream   = zlib(body)                                   (broadcast)
//!          = 0x00 ‖ zlib(body)                            (unicast, clear)
//!          = 0x01 ‖ seal(receiver, key) ‖ enc(zlib(body)) (unicast, encrypted)
//! ```
//!
//! The stream is then split into frames for one of the three frame kinds.

use super::compress::{compress, decompress};
use super::types::{Message, WireHeader};
use crate::crypto::{open, seal, CryptoError, IdentityKeys, MessageKey, SEALED_KEY_SIZE};
use crate::frame::{
    chunk_stream, encode_header, BroadcastHeader, FrameError, FrameType, RelayHeader,
};
use crate::{MessageId, UserId};
use thiserror::Error;

const FLAG_CLEAR: u8 = 0;
const FLAG_ENCRYPTED: u8 = 1;
const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Malformed message body: {0}")]
    Malformed(String),

    #[error("Unknown encryption flag: {0}")]
    UnknownFlag(u8),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// How a message travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// One hop over an established session
    Direct,
    /// Store-and-forward toward `receiver`
    Relay { receiver: UserId },
    /// Flood bounded by `ttl`
    Broadcast { ttl: u8 },
}

impl FrameKind {
    pub fn header_size(&self) -> usize {
        match self {
            FrameKind::Direct => crate::frame::header_size(FrameType::Message, true),
            FrameKind::Relay { .. } => FrameType::Message.header_size(),
            FrameKind::Broadcast { .. } => FrameType::Broadcast.header_size(),
        }
    }
}

/// One encoded frame of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// 1-based position in the stream
    pub seq: u16,
    pub is_last: bool,
    pub frame: Vec<u8>,
}

impl Fragment {
    /// Stream bytes carried by this fragment
    pub fn data(&self) -> &[u8] {
        crate::frame::payload(&self.frame)
    }
}

/// Serialize, compress and (for unicast) optionally encrypt a message.
///
/// Encryption happens only when `encrypt` is set and the receiver's identity
/// key is known. Broadcasts are never encrypted.
pub fn encode_body(
    message: &Message,
    receiver_key: Option<&[u8; 32]>,
    encrypt: bool,
    compression_level: u32,
) -> Result<Vec<u8>, PipelineError> {
    let header = serde_json::to_vec(&WireHeader::from_message(message))
        .map_err(|e| PipelineError::Malformed(e.to_string()))?;
    let data = message.data.as_deref().unwrap_or(&[]);

    let mut body = Vec::with_capacity(LENGTH_PREFIX + header.len() + data.len());
    body.extend_from_slice(&(header.len() as u32).to_be_bytes());
    body.extend_from_slice(&header);
    body.extend_from_slice(data);

    let compressed = compress(&body, compression_level)?;
    if message.is_broadcast() {
        return Ok(compressed);
    }

    match receiver_key.filter(|_| encrypt) {
        Some(key) => {
            let message_key = MessageKey::generate();
            let sealed = seal(key, &message_key.to_bytes())?;
            let ciphertext = message_key.encrypt(&compressed)?;

            let mut stream = Vec::with_capacity(1 + sealed.len() + ciphertext.len());
            stream.push(FLAG_ENCRYPTED);
            stream.extend_from_slice(&sealed);
            stream.extend_from_slice(&ciphertext);
            Ok(stream)
        }
        None => {
            let mut stream = Vec::with_capacity(1 + compressed.len());
            stream.push(FLAG_CLEAR);
            stream.extend_from_slice(&compressed);
            Ok(stream)
        }
    }
}

/// Reverse [`encode_body`].
pub fn decode_body(
    stream: &[u8],
    is_broadcast: bool,
    identity: &IdentityKeys,
) -> Result<Message, PipelineError> {
    let body = if is_broadcast {
        decompress(stream)?
    } else {
        let (flag, rest) = stream
            .split_first()
            .ok_or_else(|| PipelineError::Malformed("empty stream".into()))?;
        match *flag {
            FLAG_CLEAR => decompress(rest)?,
            FLAG_ENCRYPTED => {
                if rest.len() < SEALED_KEY_SIZE {
                    return Err(PipelineError::Malformed("truncated message key".into()));
                }
                let (sealed, ciphertext) = rest.split_at(SEALED_KEY_SIZE);
                let key_bytes = zeroize::Zeroizing::new(open(&identity.signing_key, sealed)?);
                let message_key = MessageKey::from_bytes(&key_bytes)?;
                decompress(&message_key.decrypt(ciphertext)?)?
            }
            other => return Err(PipelineError::UnknownFlag(other)),
        }
    };

    if body.len() < LENGTH_PREFIX {
        return Err(PipelineError::Malformed("missing header length".into()));
    }
    let header_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let header_end = LENGTH_PREFIX
        .checked_add(header_len)
        .filter(|end| *end <= body.len())
        .ok_or_else(|| PipelineError::Malformed("header length out of range".into()))?;

    let header: WireHeader = serde_json::from_slice(&body[LENGTH_PREFIX..header_end])
        .map_err(|e| PipelineError::Malformed(e.to_string()))?;
    Ok(header.into_message(body[header_end..].to_vec()))
}

/// Split a stream into frames of at most `payload_size` bytes.
pub fn fragment(
    stream: &[u8],
    kind: FrameKind,
    message_id: MessageId,
    payload_size: usize,
) -> Result<Vec<Fragment>, PipelineError> {
    let chunks = chunk_stream(stream, payload_size, kind.header_size())?;
    let count = chunks.len();
    if count > u16::MAX as usize {
        return Err(FrameError::TooManyFragments(count).into());
    }

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let seq = (i + 1) as u16;
            let is_last = i + 1 == count;
            let mut frame = Vec::with_capacity(kind.header_size() + chunk.len());
            match kind {
                FrameKind::Direct => frame.push(encode_header(FrameType::Message, true, is_last)),
                FrameKind::Relay { receiver } => RelayHeader {
                    message_id,
                    seq,
                    receiver,
                    is_last,
                }
                .write(&mut frame),
                FrameKind::Broadcast { ttl } => BroadcastHeader {
                    message_id,
                    seq,
                    ttl,
                    is_last,
                }
                .write(&mut frame),
            }
            frame.extend_from_slice(chunk);
            Fragment {
                seq,
                is_last,
                frame,
            }
        })
        .collect())
}
