//! Handshake messages exchanged right after a link comes up.
//!
//! The connecting side sends a request that carries its exchange public
//! value and the domain parameters it picked. The accepting side answers
//! with the same session id and its own public value over those parameters.
//! Both are JSON, split into as many handshake frames as needed.

use crate::crypto::identity::parse_public_key_hex;
use crate::crypto::{CryptoError, ExchangeKeyPair, ExchangeParams, IdentityKeys, SessionKey};
use crate::frame::{self, chunk_stream, encode_header, FrameError, FrameType};
use crate::{SessionId, UserId, PROTOCOL_VERSION};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Peer offered no exchange public key")]
    MissingSessionKey,

    #[error("Peer offered no domain parameters")]
    MissingParams,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Failed to encode handshake: {0}")]
    Encoding(String),
}

/// Handshake wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "sess_id")]
    pub session_id: SessionId,
    pub user_id: UserId,
    #[serde(rename = "user_pub_key")]
    pub user_public_key: String,
    #[serde(rename = "v")]
    pub version: String,
    /// Exchange public value, hex
    #[serde(rename = "sess_key", default)]
    pub session_key: Option<String>,
    /// Generator, decimal. Only set by the side that picked the parameters.
    #[serde(default)]
    pub g: Option<String>,
    /// Prime modulus, decimal
    #[serde(default)]
    pub p: Option<String>,
}

/// Fresh random session id in `1..i32::MAX`
pub fn random_session_id() -> SessionId {
    rand::thread_rng().gen_range(1..i32::MAX as u32)
}

impl Handshake {
    /// Request sent by the connecting side. Carries our domain parameters.
    pub fn request(user_id: UserId, identity: &IdentityKeys, key_pair: &ExchangeKeyPair) -> Self {
        let (g, p) = key_pair.params().to_decimal();
        Self {
            session_id: random_session_id(),
            user_id,
            user_public_key: identity.public_key_hex(),
            version: PROTOCOL_VERSION.to_string(),
            session_key: Some(key_pair.public_hex()),
            g: Some(g),
            p: Some(p),
        }
    }

    /// Response echoing the request's session id.
    pub fn response(
        session_id: SessionId,
        user_id: UserId,
        identity: &IdentityKeys,
        key_pair: &ExchangeKeyPair,
    ) -> Self {
        Self {
            session_id,
            user_id,
            user_public_key: identity.public_key_hex(),
            version: PROTOCOL_VERSION.to_string(),
            session_key: Some(key_pair.public_hex()),
            g: None,
            p: None,
        }
    }

    pub fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    /// Domain parameters offered by the peer.
    pub fn exchange_params(&self) -> Result<ExchangeParams, HandshakeError> {
        match (&self.g, &self.p) {
            (Some(g), Some(p)) => Ok(ExchangeParams::from_decimal(g, p)?),
            _ => Err(HandshakeError::MissingParams),
        }
    }

    /// Session key agreed with the peer's exchange public value.
    pub fn derive_session_key(&self, ours: &ExchangeKeyPair) -> Result<SessionKey, HandshakeError> {
        let peer = self
            .session_key
            .as_deref()
            .ok_or(HandshakeError::MissingSessionKey)?;
        Ok(ours.agree(peer)?)
    }

    pub fn identity_key(&self) -> Result<[u8; 32], HandshakeError> {
        Ok(parse_public_key_hex(&self.user_public_key)?)
    }

    /// Serialize and split into handshake frames of at most `payload_size`.
    pub fn to_frames(
        &self,
        frame_type: FrameType,
        payload_size: usize,
    ) -> Result<Vec<Vec<u8>>, HandshakeError> {
        if !frame_type.is_handshake() {
            return Err(FrameError::UnexpectedType(frame_type).into());
        }
        let json =
            serde_json::to_vec(self).map_err(|e| HandshakeError::Encoding(e.to_string()))?;
        let chunks = chunk_stream(&json, payload_size, frame_type.header_size())?;
        let count = chunks.len();
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut out = Vec::with_capacity(1 + chunk.len());
                // Handshake frames travel before any session and carry the direct bit
                out.push(encode_header(frame_type, true, i + 1 == count));
                out.extend_from_slice(chunk);
                out
            })
            .collect())
    }
}

/// Reassembles a handshake from its frames
#[derive(Debug, Default)]
pub struct HandshakeBuilder {
    buffer: Vec<u8>,
}

impl HandshakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. Returns `true` when it was the last one.
    pub fn push(&mut self, frame: &[u8]) -> bool {
        self.buffer.extend_from_slice(frame::payload(frame));
        frame::is_last(frame)
    }

    /// Parse what was collected so far. Malformed or partial input yields
    /// `None`.
    pub fn build(&self) -> Option<Handshake> {
        serde_json::from_slice(&self.buffer).ok()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
