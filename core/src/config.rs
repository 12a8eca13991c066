//! Protocol tunables
//!
//! Everything both ends of a link must agree on is fixed by the protocol;
//! what is left here only changes local behavior (sizes, retention,
//! pacing).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid payload size: must be {min}-{max}, got {got}")]
    InvalidPayloadSize { min: usize, max: usize, got: usize },

    #[error("Invalid compression level: must be 0-9, got {0}")]
    InvalidCompressionLevel(u32),

    #[error("Invalid exchange key size: must be a multiple of 64 between 128 and 4096, got {0}")]
    InvalidExchangeKeyBits(usize),

    #[error("Invalid persistence window: must be > 0")]
    InvalidPersistenceWindow,
}

// ============================================================================
// CONFIG
// ============================================================================

/// Largest frame the link layer accepts, session tag included.
pub const MAX_LINK_FRAME: usize = 512;
/// Authentication tag added by session encryption.
pub const SESSION_TAG_SIZE: usize = 16;
/// Smallest payload that still leaves room for data after a relay header.
pub const MIN_PAYLOAD_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Plaintext frame size, header included
    pub payload_size: usize,
    /// zlib level applied to message bodies (0-9)
    pub compression_level: u32,
    /// Encrypt unicast message bodies for their receiver
    pub encryption: bool,
    /// How long stored blocks and acks are kept, in seconds
    pub persistence_window_secs: u64,
    /// Upper bound of stored blocks replayed to a newly connected peer
    pub max_replay_blocks: usize,
    /// Cool-down before retrying a peer with a different protocol version
    pub incompatibility_timeout_ms: u64,
    /// Size of the exchange prime, in bits
    pub exchange_key_bits: usize,
    /// Sender loop wait when both queues are empty
    pub sender_idle_wait_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            payload_size: 495,
            compression_level: 9,
            encryption: true,
            persistence_window_secs: 7 * 24 * 60 * 60,
            max_replay_blocks: 1250,
            incompatibility_timeout_ms: 300_000,
            exchange_key_bits: 512,
            sender_idle_wait_ms: 50,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = MAX_LINK_FRAME - SESSION_TAG_SIZE;
        if self.payload_size < MIN_PAYLOAD_SIZE || self.payload_size > max {
            return Err(ConfigError::InvalidPayloadSize {
                min: MIN_PAYLOAD_SIZE,
                max,
                got: self.payload_size,
            });
        }

        if self.compression_level > 9 {
            return Err(ConfigError::InvalidCompressionLevel(self.compression_level));
        }

        if self.exchange_key_bits < 128
            || self.exchange_key_bits > 4096
            || self.exchange_key_bits % 64 != 0
        {
            return Err(ConfigError::InvalidExchangeKeyBits(self.exchange_key_bits));
        }

        if self.persistence_window_secs == 0 {
            return Err(ConfigError::InvalidPersistenceWindow);
        }

        Ok(())
    }

    /// Payload size usable on a link whose transport accepts `link_max`
    /// byte writes.
    pub fn effective_payload_size(&self, link_max: usize) -> usize {
        self.payload_size
            .min(link_max.saturating_sub(SESSION_TAG_SIZE))
            .max(MIN_PAYLOAD_SIZE)
    }

    pub fn incompatibility_timeout(&self) -> Duration {
        Duration::from_millis(self.incompatibility_timeout_ms)
    }

    pub fn sender_idle_wait(&self) -> Duration {
        Duration::from_millis(self.sender_idle_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProtocolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.payload_size, 495);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.max_replay_blocks, 1250);
        assert_eq!(config.persistence_window_secs, 604_800);
    }

    #[test]
    fn test_payload_size_bounds() {
        let config = ProtocolConfig {
            payload_size: 497,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPayloadSize { got: 497, .. })
        ));

        let config = ProtocolConfig {
            payload_size: 11,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exchange_bits_must_be_aligned() {
        let config = ProtocolConfig {
            exchange_key_bits: 500,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidExchangeKeyBits(500))
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ProtocolConfig =
            serde_json::from_str(r#"{"payload_size": 200, "encryption": false}"#).unwrap();
        assert_eq!(config.payload_size, 200);
        assert!(!config.encryption);
        assert_eq!(config.compression_level, 9);
    }

    #[test]
    fn test_effective_payload_size_respects_link() {
        let config = ProtocolConfig::default();
        assert_eq!(config.effective_payload_size(512), 495);
        assert_eq!(config.effective_payload_size(200), 184);
        assert_eq!(config.effective_payload_size(0), MIN_PAYLOAD_SIZE);
    }
}
