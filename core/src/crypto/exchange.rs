// Finite-field Diffie-Hellman used by the handshake
//
// The connecting side picks the domain parameters (g, p) and ships them as
// decimal strings; the accepting side builds its key pair over the same
// parameters. Public values travel as hex.

use super::{CryptoError, SessionKey};
use num_bigint_dig::{BigUint, RandBigInt, RandPrime};
use rand::rngs::OsRng;

/// Changing this breaks compatibility with every peer.
const KDF_CONTEXT: &str = "skein v1 session key 2026-10-01";

/// Refuse to do arithmetic on absurd moduli sent by a peer.
const MAX_MODULUS_BITS: usize = 4096;
const MIN_MODULUS_BITS: usize = 64;

/// Domain parameters: generator and prime modulus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeParams {
    pub g: BigUint,
    pub p: BigUint,
}

impl ExchangeParams {
    /// Fresh parameters with a random `bits`-bit prime and generator 2.
    pub fn generate(bits: usize) -> Self {
        let mut rng = OsRng;
        let p = rng.gen_prime(bits);
        Self {
            g: BigUint::from(2u32),
            p,
        }
    }

    /// Parse decimal `g` and `p` as carried in a handshake.
    pub fn from_decimal(g: &str, p: &str) -> Result<Self, CryptoError> {
        let g = BigUint::parse_bytes(g.as_bytes(), 10)
            .ok_or_else(|| CryptoError::InvalidExchangeParams("g is not a decimal".into()))?;
        let p = BigUint::parse_bytes(p.as_bytes(), 10)
            .ok_or_else(|| CryptoError::InvalidExchangeParams("p is not a decimal".into()))?;
        let params = Self { g, p };
        params.validate()?;
        Ok(params)
    }

    pub fn to_decimal(&self) -> (String, String) {
        (self.g.to_str_radix(10), self.p.to_str_radix(10))
    }

    fn validate(&self) -> Result<(), CryptoError> {
        let bits = self.p.bits();
        if !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&bits) {
            return Err(CryptoError::InvalidExchangeParams(format!(
                "modulus of {} bits",
                bits
            )));
        }
        let one = BigUint::from(1u32);
        let p_minus_one = &self.p - &one;
        if self.g <= one || self.g >= p_minus_one {
            return Err(CryptoError::InvalidExchangeParams(
                "generator out of range".into(),
            ));
        }
        Ok(())
    }
}

/// Ephemeral key pair over a set of domain parameters
pub struct ExchangeKeyPair {
    params: ExchangeParams,
    private: BigUint,
    public: BigUint,
}

impl ExchangeKeyPair {
    pub fn generate(params: &ExchangeParams) -> Self {
        let mut rng = OsRng;
        let low = BigUint::from(2u32);
        let high = &params.p - &low;
        let private = rng.gen_biguint_range(&low, &high);
        let public = params.g.modpow(&private, &params.p);
        Self {
            params: params.clone(),
            private,
            public,
        }
    }

    pub fn params(&self) -> &ExchangeParams {
        &self.params
    }

    pub fn public_hex(&self) -> String {
        self.public.to_str_radix(16)
    }

    /// Derive the session key from the peer's hex encoded public value.
    pub fn agree(&self, peer_public_hex: &str) -> Result<SessionKey, CryptoError> {
        let peer = BigUint::parse_bytes(peer_public_hex.as_bytes(), 16)
            .ok_or(CryptoError::InvalidPublicKey)?;

        let one = BigUint::from(1u32);
        let p_minus_one = &self.params.p - &one;
        if peer <= one || peer >= p_minus_one {
            return Err(CryptoError::InvalidPublicKey);
        }

        let shared = peer.modpow(&self.private, &self.params.p);
        Ok(SessionKey::from_bytes(blake3::derive_key(
            KDF_CONTEXT,
            &shared.to_bytes_be(),
        )))
    }
}

impl std::fmt::Debug for ExchangeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeKeyPair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ExchangeParams {
        ExchangeParams::generate(128)
    }

    #[test]
    fn test_generated_params_shape() {
        let params = small_params();
        assert_eq!(params.g, BigUint::from(2u32));
        assert_eq!(params.p.bits(), 128);
    }

    #[test]
    fn test_complementary_pairs_agree() {
        let params = small_params();
        let a = ExchangeKeyPair::generate(&params);
        let b = ExchangeKeyPair::generate(&params);

        let ka = a.agree(&b.public_hex()).unwrap();
        let kb = b.agree(&a.public_hex()).unwrap();
        assert_eq!(ka.as_bytes(), kb.as_bytes());
    }

    #[test]
    fn test_peer_params_roundtrip_through_decimal() {
        let params = small_params();
        let (g, p) = params.to_decimal();
        let parsed = ExchangeParams::from_decimal(&g, &p).unwrap();
        assert_eq!(parsed, params);

        // Accepting side builds over the connecting side's parameters
        let a = ExchangeKeyPair::generate(&params);
        let b = ExchangeKeyPair::generate(&parsed);
        assert_eq!(
            a.agree(&b.public_hex()).unwrap().as_bytes(),
            b.agree(&a.public_hex()).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_different_params_disagree() {
        let a = ExchangeKeyPair::generate(&small_params());
        let b = ExchangeKeyPair::generate(&small_params());
        let ka = a.agree(&b.public_hex());
        let kb = b.agree(&a.public_hex());
        if let (Ok(ka), Ok(kb)) = (ka, kb) {
            assert_ne!(ka.as_bytes(), kb.as_bytes());
        }
    }

    #[test]
    fn test_degenerate_public_values_rejected() {
        let a = ExchangeKeyPair::generate(&small_params());
        for bad in ["1", "0", "zz"] {
            assert!(matches!(a.agree(bad), Err(CryptoError::InvalidPublicKey)));
        }
    }

    #[test]
    fn test_invalid_decimal_params() {
        assert!(ExchangeParams::from_decimal("2", "abc").is_err());
        assert!(ExchangeParams::from_decimal("1", "340282366920938463463374607431768211507").is_err());
        // too small a modulus
        assert!(ExchangeParams::from_decimal("2", "23").is_err());
    }
}
