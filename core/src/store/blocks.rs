// Block store: fragments of relayed and broadcast messages
//
// Every fragment we receive or originate (direct ones included) is kept
// until it expires, which is what lets a node carry messages between peers
// that never meet. Insertion doubles as the dedup gate for flooding.

use super::backend::StorageBackend;
use super::StoreError;
use crate::frame::{BroadcastHeader, RelayHeader};
use crate::{MessageId, UserId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const BLOCK_PREFIX: &[u8] = b"blk/";
const MESSAGE_PREFIX: &[u8] = b"msg/";

/// One stored fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub message_id: MessageId,
    /// 1-based
    pub seq: u16,
    pub ttl: u8,
    /// `None` for broadcasts
    pub receiver: Option<UserId>,
    pub is_last: bool,
    /// Unix seconds
    pub received_at: u64,
    pub data: Vec<u8>,
}

impl Block {
    /// Rebuild the frame this block travels in.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(RelayHeader::SIZE + 1 + self.data.len());
        match self.receiver {
            Some(receiver) => RelayHeader {
                message_id: self.message_id,
                seq: self.seq,
                receiver,
                is_last: self.is_last,
            }
            .write(&mut frame),
            None => BroadcastHeader {
                message_id: self.message_id,
                seq: self.seq,
                ttl: self.ttl,
                is_last: self.is_last,
            }
            .write(&mut frame),
        }
        frame.extend_from_slice(&self.data);
        frame
    }

    fn is_expired(&self, now: u64, window_secs: u64) -> bool {
        now.saturating_sub(self.received_at) > window_secs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockRecord {
    ttl: u8,
    receiver: Option<UserId>,
    is_last: bool,
    received_at: u64,
    data: Vec<u8>,
}

/// Per-message bookkeeping shared by all of its blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    receiver: Option<UserId>,
    /// Number of fragments, known once the last one arrived
    size: Option<u16>,
}

fn message_key(message_id: MessageId) -> Vec<u8> {
    let mut key = Vec::with_capacity(MESSAGE_PREFIX.len() + 4);
    key.extend_from_slice(MESSAGE_PREFIX);
    key.extend_from_slice(&message_id.to_be_bytes());
    key
}

fn blocks_prefix(message_id: MessageId) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_PREFIX.len() + 6);
    key.extend_from_slice(BLOCK_PREFIX);
    key.extend_from_slice(&message_id.to_be_bytes());
    key
}

fn block_key(message_id: MessageId, seq: u16) -> Vec<u8> {
    let mut key = blocks_prefix(message_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn parse_block_key(key: &[u8]) -> Option<(MessageId, u16)> {
    let rest = key.strip_prefix(BLOCK_PREFIX)?;
    if rest.len() != 6 {
        return None;
    }
    Some((
        MessageId::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]),
        u16::from_be_bytes([rest[4], rest[5]]),
    ))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub struct BlockStore {
    backend: Arc<dyn StorageBackend>,
    /// Serializes the read-check-write sequence of `insert`
    write_lock: Mutex<()>,
}

impl BlockStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    fn message_record(&self, message_id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.backend
            .get(&message_key(message_id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Store a block. Returns `false` for a duplicate (message id, seq) or a
    /// block whose receiver disagrees with the blocks already stored.
    pub fn insert(&self, block: &Block) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();

        let mut record = match self.message_record(block.message_id)? {
            Some(record) if record.receiver != block.receiver => {
                debug!(
                    "Rejecting block {}#{}: receiver {:?} != {:?}",
                    block.message_id, block.seq, block.receiver, record.receiver
                );
                return Ok(false);
            }
            Some(record) => record,
            None => MessageRecord {
                receiver: block.receiver,
                size: None,
            },
        };

        let value = encode(&BlockRecord {
            ttl: block.ttl,
            receiver: block.receiver,
            is_last: block.is_last,
            received_at: block.received_at,
            data: block.data.clone(),
        })?;
        if !self
            .backend
            .insert_if_absent(&block_key(block.message_id, block.seq), &value)?
        {
            return Ok(false);
        }

        if block.is_last {
            record.size = Some(block.seq);
        }
        self.backend
            .put(&message_key(block.message_id), &encode(&record)?)?;
        Ok(true)
    }

    pub fn exists(&self, message_id: MessageId, seq: u16) -> Result<bool, StoreError> {
        self.backend.contains(&block_key(message_id, seq))
    }

    /// Number of fragments, once the last one has been stored.
    pub fn message_size(&self, message_id: MessageId) -> Result<Option<u16>, StoreError> {
        Ok(self.message_record(message_id)?.and_then(|r| r.size))
    }

    pub fn is_complete(&self, message_id: MessageId) -> Result<bool, StoreError> {
        match self.message_size(message_id)? {
            Some(size) => {
                Ok(self.backend.count_prefix(&blocks_prefix(message_id))? == size as usize)
            }
            None => Ok(false),
        }
    }

    /// Concatenated block data of a complete message, in sequence order.
    pub fn read_message(&self, message_id: MessageId) -> Result<Option<Vec<u8>>, StoreError> {
        if !self.is_complete(message_id)? {
            return Ok(None);
        }
        let mut stream = Vec::new();
        for (_, value) in self.backend.scan_prefix(&blocks_prefix(message_id))? {
            let record: BlockRecord = decode(&value)?;
            stream.extend_from_slice(&record.data);
        }
        Ok(Some(stream))
    }

    fn all_blocks(&self) -> Result<Vec<Block>, StoreError> {
        let mut blocks = Vec::new();
        for (key, value) in self.backend.scan_prefix(BLOCK_PREFIX)? {
            let Some((message_id, seq)) = parse_block_key(&key) else {
                continue;
            };
            let record: BlockRecord = decode(&value)?;
            blocks.push(Block {
                message_id,
                seq,
                ttl: record.ttl,
                receiver: record.receiver,
                is_last: record.is_last,
                received_at: record.received_at,
                data: record.data,
            });
        }
        Ok(blocks)
    }

    /// Blocks worth handing to a newly met peer: still hopping, not expired
    /// and not addressed to us. Newest first, at most `limit`.
    pub fn sendable(
        &self,
        self_id: UserId,
        now: u64,
        window_secs: u64,
        limit: usize,
    ) -> Result<Vec<Block>, StoreError> {
        let mut blocks: Vec<Block> = self
            .all_blocks()?
            .into_iter()
            .filter(|b| b.ttl > 0 && !b.is_expired(now, window_secs) && b.receiver != Some(self_id))
            .collect();
        blocks.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        blocks.truncate(limit);
        Ok(blocks)
    }

    /// Blocks that can go: expired, or part of a complete message addressed
    /// to us.
    pub fn removable(
        &self,
        self_id: UserId,
        now: u64,
        window_secs: u64,
    ) -> Result<Vec<(MessageId, u16)>, StoreError> {
        let mut out = Vec::new();
        let mut delivered: Option<(MessageId, bool)> = None;
        for block in self.all_blocks()? {
            if block.is_expired(now, window_secs) {
                out.push((block.message_id, block.seq));
                continue;
            }
            if block.receiver != Some(self_id) {
                continue;
            }
            let complete = match delivered {
                Some((id, complete)) if id == block.message_id => complete,
                _ => {
                    let complete = self.is_complete(block.message_id)?;
                    delivered = Some((block.message_id, complete));
                    complete
                }
            };
            if complete {
                out.push((block.message_id, block.seq));
            }
        }
        Ok(out)
    }

    /// Delete one block; the message record goes with the last block.
    pub fn remove(&self, message_id: MessageId, seq: u16) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.backend.remove(&block_key(message_id, seq))?;
        if self.backend.count_prefix(&blocks_prefix(message_id))? == 0 {
            self.backend.remove(&message_key(message_id))?;
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(BLOCK_PREFIX)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;

    const DAY: u64 = 24 * 60 * 60;

    fn store() -> BlockStore {
        BlockStore::new(Arc::new(MemoryStorage::new()))
    }

    fn block(message_id: MessageId, seq: u16, is_last: bool, receiver: Option<UserId>) -> Block {
        Block {
            message_id,
            seq,
            ttl: 2,
            receiver,
            is_last,
            received_at: 1_000,
            data: vec![seq as u8; 3],
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let store = store();
        let b = block(1, 1, false, None);
        assert!(store.insert(&b).unwrap());
        assert!(!store.insert(&b).unwrap());
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.exists(1, 1).unwrap());
    }

    #[test]
    fn test_receiver_mismatch_rejected() {
        let store = store();
        assert!(store.insert(&block(1, 1, false, Some(5))).unwrap());
        assert!(!store.insert(&block(1, 2, true, Some(6))).unwrap());
        assert!(!store.insert(&block(1, 2, true, None)).unwrap());
        assert!(store.insert(&block(1, 2, true, Some(5))).unwrap());
    }

    #[test]
    fn test_completion_any_order() {
        let store = store();
        store.insert(&block(9, 3, true, None)).unwrap();
        assert_eq!(store.message_size(9).unwrap(), Some(3));
        assert!(!store.is_complete(9).unwrap());
        assert!(store.read_message(9).unwrap().is_none());

        store.insert(&block(9, 1, false, None)).unwrap();
        store.insert(&block(9, 2, false, None)).unwrap();
        assert!(store.is_complete(9).unwrap());
        assert_eq!(
            store.read_message(9).unwrap().unwrap(),
            vec![1, 1, 1, 2, 2, 2, 3, 3, 3]
        );
    }

    #[test]
    fn test_sendable_filters_and_orders() {
        let store = store();
        let mut old = block(1, 1, true, None);
        old.received_at = 500;
        let mut newer = block(2, 1, true, Some(7));
        newer.received_at = 900;
        let mut spent = block(3, 1, true, None);
        spent.ttl = 0;
        let mine = block(4, 1, true, Some(42));
        for b in [&old, &newer, &spent, &mine] {
            store.insert(b).unwrap();
        }

        let sendable = store.sendable(42, 1_000, 7 * DAY, 10).unwrap();
        let ids: Vec<MessageId> = sendable.iter().map(|b| b.message_id).collect();
        assert_eq!(ids, vec![2, 1]);

        let limited = store.sendable(42, 1_000, 7 * DAY, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].message_id, 2);

        assert!(store.sendable(42, 1_000 + 8 * DAY, 7 * DAY, 10).unwrap().is_empty());
    }

    #[test]
    fn test_removable_and_remove() {
        let store = store();
        // complete and addressed to us
        store.insert(&block(1, 1, true, Some(42))).unwrap();
        // incomplete and addressed to us
        store.insert(&block(2, 1, false, Some(42))).unwrap();
        // complete but for someone else
        store.insert(&block(3, 1, true, Some(7))).unwrap();

        let removable = store.removable(42, 1_000, 7 * DAY).unwrap();
        assert_eq!(removable, vec![(1, 1)]);

        let expired = store.removable(42, 1_000 + 8 * DAY, 7 * DAY).unwrap();
        assert_eq!(expired.len(), 3);

        store.remove(1, 1).unwrap();
        assert!(!store.exists(1, 1).unwrap());
        assert_eq!(store.message_size(1).unwrap(), None);
    }

    #[test]
    fn test_to_frame_rebuilds_headers() {
        let relay = block(5, 2, true, Some(8)).to_frame();
        let header = RelayHeader::parse(&relay).unwrap();
        assert_eq!((header.message_id, header.seq, header.receiver), (5, 2, 8));
        assert!(header.is_last);

        let broadcast = block(6, 1, false, None).to_frame();
        let header = BroadcastHeader::parse(&broadcast).unwrap();
        assert_eq!(header.ttl, 2);
        assert_eq!(crate::frame::payload(&broadcast), &[1, 1, 1]);
    }
}
