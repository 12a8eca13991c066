// Link tables guarded by the manager's lock

use super::events::ProtocolEvent;
use crate::crypto::ExchangeKeyPair;
use crate::handshake::{Handshake, HandshakeBuilder};
use crate::session::Session;
use crate::transport::LinkRole;
use crate::UserId;
use std::collections::HashMap;

/// A device with an established session
#[derive(Debug)]
pub(crate) struct Device {
    pub address: String,
    pub public_key: [u8; 32],
    pub session: Session,
}

/// A link whose handshake is still running
#[derive(Debug)]
pub(crate) struct PendingPeer {
    pub role: LinkRole,
    pub builder: HandshakeBuilder,
    /// Request we issued, initiator only
    pub request: Option<Handshake>,
    pub key_pair: Option<ExchangeKeyPair>,
}

impl PendingPeer {
    pub fn new(role: LinkRole) -> Self {
        Self {
            role,
            builder: HandshakeBuilder::new(),
            request: None,
            key_pair: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LinkState {
    pub devices: HashMap<UserId, Device>,
    pub addresses: HashMap<String, UserId>,
    pub pending: HashMap<String, PendingPeer>,
    /// address → unix millis when the peer was found incompatible
    pub incompatible: HashMap<String, u64>,
    pub scanning: bool,
}

impl LinkState {
    pub fn device_at(&mut self, address: &str) -> Option<&mut Device> {
        let user_id = self.addresses.get(address)?;
        self.devices.get_mut(user_id)
    }

    pub fn address_of(&self, user_id: UserId) -> Option<&str> {
        self.devices.get(&user_id).map(|d| d.address.as_str())
    }

    /// Connected, connecting, or incompatible within the cool-down
    pub fn is_known(&self, address: &str, now_ms: u64, cooldown_ms: u64) -> bool {
        self.addresses.contains_key(address)
            || self.pending.contains_key(address)
            || self
                .incompatible
                .get(address)
                .map(|since| now_ms.saturating_sub(*since) < cooldown_ms)
                .unwrap_or(false)
    }

    /// Addresses of every connected device except `except`
    pub fn peer_addresses(&self, except: Option<&str>) -> Vec<String> {
        self.devices
            .values()
            .map(|d| d.address.clone())
            .filter(|a| Some(a.as_str()) != except)
            .collect()
    }

    /// Drop a connected device. Returns its user id.
    pub fn remove_device(&mut self, address: &str) -> Option<UserId> {
        let user_id = self.addresses.remove(address)?;
        self.devices.remove(&user_id);
        Some(user_id)
    }
}

/// Transport requests deferred until the state lock is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkAction {
    Connect(String),
    Disconnect(String),
    StartScan,
    StopScan,
}

/// Side effects collected while holding the lock
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub actions: Vec<LinkAction>,
    pub events: Vec<ProtocolEvent>,
}

impl Effects {
    pub fn act(&mut self, action: LinkAction) {
        self.actions.push(action);
    }

    pub fn emit(&mut self, event: ProtocolEvent) {
        self.events.push(event);
    }
}
