// Long-term identity keys
//
// The Ed25519 public key is what peers learn during the handshake and what
// relay senders seal message keys to.

use super::CryptoError;
use ed25519_dalek::{SigningKey, VerifyingKey};
use zeroize::{Zeroize, Zeroizing};

#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate new identity keys
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key as exchanged in handshakes
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Short fingerprint for logs and display (Blake3 of the public key)
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.public_key_bytes());
        hex::encode(&hash.as_bytes()[..8])
    }

    /// Serialize the secret key.
    /// Returns a `Zeroizing<Vec<u8>>` that wipes the secret on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("expected 32 bytes".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }
}

/// Parse and validate a hex encoded Ed25519 public key.
pub fn parse_public_key_hex(hex_str: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidPublicKey)?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&key).map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(key)
}
