// Sealed box: wraps per-message keys for a receiver's identity key
//
// Flow:
// 1. Convert receiver's Ed25519 public key → X25519 public key
// 2. Generate ephemeral X25519 keypair
// 3. ECDH: ephemeral_secret × receiver_x25519_public → shared_secret
// 4. KDF: Blake3::derive_key(shared_secret) → wrapping key
// 5. Encrypt: XChaCha20-Poly1305(wrapping key, random nonce, plaintext, aad = ephemeral_pub)
// 6. Output: ephemeral_pub (32) ‖ nonce (24) ‖ ciphertext
//
// Receiver reverses with the X25519 secret derived from its signing key.

use super::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Changing this breaks every relay message still in flight.
const KDF_CONTEXT: &str = "skein v1 sealed message key 2026-10-01";

const EPHEMERAL_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Size of a sealed [`super::MessageKey`]
pub const SEALED_KEY_SIZE: usize =
    EPHEMERAL_SIZE + NONCE_SIZE + super::cipher::MessageKey::SIZE + TAG_SIZE;

/// Ed25519 secret scalar is SHA-512(secret)[0..32]; x25519-dalek clamps it.
fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Birational map from Edwards to Montgomery form.
fn ed25519_public_to_x25519(public_key_bytes: &[u8; 32]) -> Result<X25519PublicKey, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let edwards_point = CompressedEdwardsY(*public_key_bytes)
        .decompress()
        .ok_or(CryptoError::InvalidPublicKey)?;

    Ok(X25519PublicKey::from(
        edwards_point.to_montgomery().to_bytes(),
    ))
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT, shared_secret)
}

/// Encrypt `plaintext` so that only the holder of `receiver_public_key`'s
/// signing key can read it.
pub fn seal(receiver_public_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let receiver_x25519 = ed25519_public_to_x25519(receiver_public_key)?;

    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
    let shared_secret = ephemeral_secret.diffie_hellman(&receiver_x25519);

    let mut wrapping_key = derive_key(shared_secret.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(&wrapping_key)
        .map_err(|_| CryptoError::EncryptionFailed);
    wrapping_key.zeroize();

    let ciphertext = cipher?
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: ephemeral_public.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(EPHEMERAL_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse [`seal`] with the receiver's signing key.
pub fn open(receiver_signing_key: &SigningKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let min = EPHEMERAL_SIZE + NONCE_SIZE + TAG_SIZE;
    if sealed.len() < min {
        return Err(CryptoError::CiphertextTooShort {
            need: min,
            got: sealed.len(),
        });
    }

    let (ephemeral, rest) = sealed.split_at(EPHEMERAL_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let mut ephemeral_bytes = [0u8; EPHEMERAL_SIZE];
    ephemeral_bytes.copy_from_slice(ephemeral);
    let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);

    let receiver_secret = ed25519_to_x25519_secret(receiver_signing_key);
    let shared_secret = receiver_secret.diffie_hellman(&ephemeral_public);
    let mut wrapping_key = derive_key(shared_secret.as_bytes());

    let cipher = XChaCha20Poly1305::new_from_slice(&wrapping_key)
        .map_err(|_| CryptoError::DecryptionFailed);
    wrapping_key.zeroize();

    cipher?
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: ephemeral,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeys;

    #[test]
    fn test_seal_open_roundtrip() {
        let receiver = IdentityKeys::generate();
        let sealed = seal(&receiver.public_key_bytes(), b"message key").unwrap();
        let opened = open(&receiver.signing_key, &sealed).unwrap();
        assert_eq!(opened, b"message key");
    }

    #[test]
    fn test_sealed_key_size_is_fixed() {
        let receiver = IdentityKeys::generate();
        let sealed = seal(&receiver.public_key_bytes(), &[7u8; 56]).unwrap();
        assert_eq!(sealed.len(), SEALED_KEY_SIZE);
        assert_eq!(SEALED_KEY_SIZE, 128);
    }

    #[test]
    fn test_wrong_receiver_cannot_open() {
        let receiver = IdentityKeys::generate();
        let other = IdentityKeys::generate();
        let sealed = seal(&receiver.public_key_bytes(), b"secret").unwrap();
        assert_eq!(
            open(&other.signing_key, &sealed),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_ephemeral_rejected() {
        let receiver = IdentityKeys::generate();
        let mut sealed = seal(&receiver.public_key_bytes(), b"secret").unwrap();
        sealed[0] ^= 0x01;
        assert!(open(&receiver.signing_key, &sealed).is_err());
    }

    #[test]
    fn test_short_input_rejected() {
        let receiver = IdentityKeys::generate();
        assert!(matches!(
            open(&receiver.signing_key, &[0u8; 10]),
            Err(CryptoError::CiphertextTooShort { got: 10, .. })
        ));
    }
}
