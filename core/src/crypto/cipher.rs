// Symmetric ciphers: per-message keys and per-session frame encryption
//
// Both use XChaCha20-Poly1305. Session nonces are never sent; each side
// draws them from a seeded sequence that the peer mirrors, so every frame
// on a link must be encrypted and decrypted exactly once and in order.

use super::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Symmetric key shared by both ends of a session
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encrypt a frame. The header byte stays readable and is authenticated.
    pub fn encrypt_frame(&self, iv: &mut IvSequence, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = iv.next_nonce();
        let Some((header, body)) = frame.split_first() else {
            return Err(CryptoError::CiphertextTooShort { need: 1, got: 0 });
        };
        let cipher =
            XChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::EncryptionFailed)?;
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: body,
                    aad: std::slice::from_ref(header),
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(1 + ciphertext.len());
        out.push(*header);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Reverse [`SessionKey::encrypt_frame`]. Consumes one nonce even on failure.
    pub fn decrypt_frame(&self, iv: &mut IvSequence, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = iv.next_nonce();
        if frame.len() < 1 + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort {
                need: 1 + TAG_SIZE,
                got: frame.len(),
            });
        }
        let (header, body) = frame.split_at(1);
        let cipher =
            XChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::DecryptionFailed)?;
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: body,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(1 + plaintext.len());
        out.push(header[0]);
        out.extend_from_slice(&plaintext);
        Ok(out)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Deterministic nonce sequence shared by both ends of one direction of a link
pub struct IvSequence {
    rng: ChaCha20Rng,
}

impl IvSequence {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// Seed for one direction of a session: `session_id × user_id`,
    /// wrapping in 32 bits.
    pub fn seed_for(session_id: u32, user_id: u32) -> u64 {
        u64::from(session_id.wrapping_mul(user_id))
    }

    pub fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        self.rng.fill_bytes(&mut nonce);
        nonce
    }
}

/// Random key and nonce protecting one message body
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey {
    key: [u8; 32],
    nonce: [u8; NONCE_SIZE],
}

impl MessageKey {
    /// Serialized size: key followed by nonce
    pub const SIZE: usize = 32 + NONCE_SIZE;

    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    pub fn to_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.nonce);
        zeroize::Zeroizing::new(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::SIZE {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "message key of {} bytes",
                bytes.len()
            )));
        }
        let mut key = [0u8; 32];
        let mut nonce = [0u8; NONCE_SIZE];
        key.copy_from_slice(&bytes[..32]);
        nonce.copy_from_slice(&bytes[32..]);
        Ok(Self { key, nonce })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| CryptoError::EncryptionFailed)?
            .encrypt(XNonce::from_slice(&self.nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| CryptoError::DecryptionFailed)?
            .decrypt(XNonce::from_slice(&self.nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
