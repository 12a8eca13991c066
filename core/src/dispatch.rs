//! Outbound frame queues.
//!
//! Two FIFO lanes feed the sender loop: `Priority` for handshake and ack
//! frames, `Bulk` for message data. Priority always drains first. Order is
//! kept per lane; there is no ordering across links.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Priority,
    Bulk,
}

/// A plaintext frame waiting for its link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub address: String,
    pub frame: Vec<u8>,
}

#[derive(Default)]
struct Lanes {
    priority: VecDeque<OutboundFrame>,
    bulk: VecDeque<OutboundFrame>,
}

impl Lanes {
    fn pop(&mut self) -> Option<OutboundFrame> {
        self.priority.pop_front().or_else(|| self.bulk.pop_front())
    }
}

#[derive(Default)]
pub struct SendQueues {
    lanes: Mutex<Lanes>,
    ready: Condvar,
}

impl SendQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, lane: Lane, address: &str, frame: Vec<u8>) {
        let item = OutboundFrame {
            address: address.to_string(),
            frame,
        };
        let mut lanes = self.lanes.lock();
        match lane {
            Lane::Priority => lanes.priority.push_back(item),
            Lane::Bulk => lanes.bulk.push_back(item),
        }
        self.ready.notify_one();
    }

    pub fn try_pop(&self) -> Option<OutboundFrame> {
        self.lanes.lock().pop()
    }

    /// Pop the next frame, waiting up to `timeout` when both lanes are empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<OutboundFrame> {
        let mut lanes = self.lanes.lock();
        if let Some(item) = lanes.pop() {
            return Some(item);
        }
        self.ready.wait_for(&mut lanes, timeout);
        lanes.pop()
    }

    /// Drop everything queued for `address`. Returns how many frames went.
    pub fn purge(&self, address: &str) -> usize {
        let mut lanes = self.lanes.lock();
        let before = lanes.priority.len() + lanes.bulk.len();
        lanes.priority.retain(|f| f.address != address);
        lanes.bulk.retain(|f| f.address != address);
        let purged = before - lanes.priority.len() - lanes.bulk.len();
        if purged > 0 {
            debug!("Purged {} queued frames for {}", purged, address);
        }
        purged
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.priority.len() + lanes.bulk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake a waiting sender without queueing anything.
    pub fn wake(&self) {
        self.ready.notify_all();
    }
}
