// Persistence: blocks, acks and known devices over one key-value backend

pub mod acks;
pub mod backend;
pub mod blocks;
pub mod devices;

pub use acks::AckStore;
pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use blocks::{Block, BlockStore};
pub use devices::{DeviceRecord, DeviceStore};

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// All persistent state of a node
pub struct Store {
    pub blocks: BlockStore,
    pub acks: AckStore,
    pub devices: DeviceStore,
    backend: Arc<dyn StorageBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            blocks: BlockStore::new(backend.clone()),
            acks: AckStore::new(backend.clone()),
            devices: DeviceStore::new(backend.clone()),
            backend,
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SledStorage::new(path)?)))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()
    }
}
