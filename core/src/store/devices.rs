// Device store: identity keys of peers we met or were told about

use super::backend::StorageBackend;
use super::StoreError;
use crate::UserId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const DEVICE_PREFIX: &[u8] = b"dev/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub public_key: [u8; 32],
    pub updated_at: u64,
}

fn device_key(user_id: UserId) -> Vec<u8> {
    let mut key = Vec::with_capacity(DEVICE_PREFIX.len() + 4);
    key.extend_from_slice(DEVICE_PREFIX);
    key.extend_from_slice(&user_id.to_be_bytes());
    key
}

pub struct DeviceStore {
    backend: Arc<dyn StorageBackend>,
}

impl DeviceStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn get(&self, user_id: UserId) -> Result<Option<DeviceRecord>, StoreError> {
        self.backend
            .get(&device_key(user_id))?
            .map(|bytes| {
                bincode::deserialize(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()
    }

    pub fn public_key(&self, user_id: UserId) -> Result<Option<[u8; 32]>, StoreError> {
        Ok(self.get(user_id)?.map(|d| d.public_key))
    }

    /// Store or replace a device key. Returns `true` if anything changed.
    pub fn upsert(&self, user_id: UserId, public_key: [u8; 32], now: u64) -> Result<bool, StoreError> {
        if let Some(existing) = self.get(user_id)? {
            if existing.public_key == public_key {
                return Ok(false);
            }
            debug!("Public key of device {} changed", user_id);
        }
        let value = bincode::serialize(&DeviceRecord {
            public_key,
            updated_at: now,
        })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.put(&device_key(user_id), &value)?;
        Ok(true)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(DEVICE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;

    #[test]
    fn test_upsert_reports_changes() {
        let devices = DeviceStore::new(Arc::new(MemoryStorage::new()));
        assert!(devices.upsert(5, [1u8; 32], 10).unwrap());
        assert!(!devices.upsert(5, [1u8; 32], 20).unwrap());
        assert!(devices.upsert(5, [2u8; 32], 30).unwrap());

        let record = devices.get(5).unwrap().unwrap();
        assert_eq!(record.public_key, [2u8; 32]);
        assert_eq!(record.updated_at, 30);
        assert_eq!(devices.public_key(6).unwrap(), None);
        assert_eq!(devices.count().unwrap(), 1);
    }
}
