// Skein Core: opportunistic short-range mesh messaging
//
// Two phones meet, shake hands, swap whatever they carry for each other
// and for everyone else, and walk away.

pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod frame;
pub mod handshake;
pub mod link;
pub mod message;
pub mod session;
pub mod store;
pub mod transport;

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use config::{ConfigError, ProtocolConfig};
pub use crypto::IdentityKeys;
pub use link::{EventSink, GcReport, LinkManager, ProtocolEvent};
pub use message::{Message, MessageBuilder};
pub use store::Store;
pub use transport::{LinkRole, Transport, TransportError};

/// Version string exchanged during the handshake. Peers must match exactly.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Application level user identifier
pub type UserId = u32;
/// Message identifier, unique per sender with high probability
pub type MessageId = u32;
/// Per-connection handshake identifier
pub type SessionId = u32;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Rejections from the public send API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Message has no receiver")]
    ReceiverEmpty,
    #[error("Receiver is not in range")]
    OutOfRange,
    #[error("TTL must be between 1 and 255")]
    InvalidTtl,
    #[error("Cannot send a message to self")]
    SelfReceiver,
    #[error("Link manager is not started")]
    NotStarted,
    #[error("Receiver {0} is unknown")]
    UnknownReceiver(UserId),
    #[error("Failed to encode message: {0}")]
    Encoding(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SendError {
    /// Stable numeric code for hosts that surface errors as integers.
    pub fn code(&self) -> i32 {
        match self {
            SendError::ReceiverEmpty => -10,
            SendError::OutOfRange => -11,
            SendError::InvalidTtl => -12,
            SendError::SelfReceiver => -13,
            SendError::NotStarted => -14,
            SendError::UnknownReceiver(_) => -15,
            SendError::Encoding(_) => -16,
            SendError::Storage(_) => -17,
        }
    }
}

impl From<message::PipelineError> for SendError {
    fn from(err: message::PipelineError) -> Self {
        SendError::Encoding(err.to_string())
    }
}

impl From<store::StoreError> for SendError {
    fn from(err: store::StoreError) -> Self {
        SendError::Storage(err.to_string())
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the Unix epoch
pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_codes_are_distinct() {
        let errors = [
            SendError::ReceiverEmpty,
            SendError::OutOfRange,
            SendError::InvalidTtl,
            SendError::SelfReceiver,
            SendError::NotStarted,
            SendError::UnknownReceiver(1),
            SendError::Encoding(String::new()),
            SendError::Storage(String::new()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert_eq!(SendError::UnknownReceiver(3).code(), -15);
    }
}
