// Cryptography: identity keys, key exchange, message and session ciphers

pub mod cipher;
pub mod exchange;
pub mod identity;
pub mod seal;

pub use cipher::{IvSequence, MessageKey, SessionKey};
pub use exchange::{ExchangeKeyPair, ExchangeParams};
pub use identity::IdentityKeys;
pub use seal::{open, seal, SEALED_KEY_SIZE};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Invalid exchange parameters: {0}")]
    InvalidExchangeParams(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Ciphertext too short: need {need} bytes, got {got}")]
    CiphertextTooShort { need: usize, got: usize },
}
