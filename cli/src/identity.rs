// Node identity on disk: user id plus the Ed25519 secret, as JSON

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use skein_core::{IdentityKeys, UserId};
use std::path::Path;

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    user_id: UserId,
    /// Hex-encoded signing key
    secret_key: String,
}

pub struct NodeIdentity {
    pub user_id: UserId,
    pub keys: IdentityKeys,
}

impl NodeIdentity {
    /// Fresh identity. A random user id is drawn when none is given.
    pub fn generate(user_id: Option<UserId>) -> Self {
        Self {
            user_id: user_id.unwrap_or_else(|| rand::thread_rng().gen_range(1..i32::MAX as u32)),
            keys: IdentityKeys::generate(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("No identity at {} (run `skein init`)", path.display()))?;
        let stored: StoredIdentity =
            serde_json::from_str(&contents).context("Failed to parse identity file")?;
        let secret = hex::decode(&stored.secret_key).context("Identity secret is not hex")?;
        let keys = IdentityKeys::from_bytes(&secret).context("Invalid identity secret")?;
        Ok(Self {
            user_id: stored.user_id,
            keys,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let stored = StoredIdentity {
            user_id: self.user_id,
            secret_key: hex::encode(self.keys.to_bytes().as_slice()),
        };
        let contents =
            serde_json::to_string_pretty(&stored).context("Failed to serialize identity")?;
        std::fs::write(path, contents).context("Failed to write identity file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let identity = NodeIdentity::generate(Some(42));
        identity.save(&path).unwrap();

        let loaded = NodeIdentity::load(&path).unwrap();
        assert_eq!(loaded.user_id, 42);
        assert_eq!(
            loaded.keys.public_key_bytes(),
            identity.keys.public_key_bytes()
        );
    }

    #[test]
    fn test_missing_identity_mentions_init() {
        let dir = tempfile::tempdir().unwrap();
        let Err(err) = NodeIdentity::load(&dir.path().join("identity.json")) else {
            panic!("loading a missing identity must fail");
        };
        assert!(err.to_string().contains("skein init"));
    }
}
