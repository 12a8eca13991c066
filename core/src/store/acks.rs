// Ack store: delivery acknowledgments we wait for or pass along
//
// An id is either `waited` (we sent the message and want its ack) or
// forwardable (someone else's ack we gossip onward). Never both.

use super::backend::StorageBackend;
use super::StoreError;
use crate::MessageId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ACK_PREFIX: &[u8] = b"ack/";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AckRecord {
    waited: bool,
    created_at: u64,
}

fn ack_key(message_id: MessageId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ACK_PREFIX.len() + 4);
    key.extend_from_slice(ACK_PREFIX);
    key.extend_from_slice(&message_id.to_be_bytes());
    key
}

pub struct AckStore {
    backend: Arc<dyn StorageBackend>,
}

impl AckStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn records(&self) -> Result<Vec<(MessageId, AckRecord)>, StoreError> {
        let mut out = Vec::new();
        for (key, value) in self.backend.scan_prefix(ACK_PREFIX)? {
            let Some(id) = key
                .strip_prefix(ACK_PREFIX)
                .and_then(|rest| <[u8; 4]>::try_from(rest).ok())
            else {
                continue;
            };
            let record: AckRecord = bincode::deserialize(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            out.push((MessageId::from_be_bytes(id), record));
        }
        Ok(out)
    }

    /// Record an ack id. Returns `false` if the id is already known in
    /// either state.
    pub fn insert(&self, message_id: MessageId, waited: bool, now: u64) -> Result<bool, StoreError> {
        let value = bincode::serialize(&AckRecord {
            waited,
            created_at: now,
        })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.insert_if_absent(&ack_key(message_id), &value)
    }

    pub fn contains(&self, message_id: MessageId) -> Result<bool, StoreError> {
        self.backend.contains(&ack_key(message_id))
    }

    pub fn is_waited(&self, message_id: MessageId) -> Result<bool, StoreError> {
        match self.backend.get(&ack_key(message_id))? {
            Some(bytes) => {
                let record: AckRecord = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(record.waited)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, message_id: MessageId) -> Result<(), StoreError> {
        self.backend.remove(&ack_key(message_id))
    }

    /// Forwardable ack ids that have not expired
    pub fn sendable(&self, now: u64, window_secs: u64) -> Result<Vec<MessageId>, StoreError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|(_, r)| !r.waited && now.saturating_sub(r.created_at) <= window_secs)
            .map(|(id, _)| id)
            .collect())
    }

    /// Drop acks older than the window. Returns how many went.
    pub fn remove_expired(&self, now: u64, window_secs: u64) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (id, record) in self.records()? {
            if now.saturating_sub(record.created_at) > window_secs {
                self.remove(id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
