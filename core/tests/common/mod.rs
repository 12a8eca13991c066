// Shared scaffolding for multi-node tests on the in-process medium
#![allow(dead_code)]

use skein_core::transport::LocalMedium;
use skein_core::{IdentityKeys, LinkManager, ProtocolConfig, ProtocolEvent, Store, UserId};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub struct Node {
    pub address: String,
    pub manager: Arc<LinkManager>,
    pub events: UnboundedReceiver<ProtocolEvent>,
}

impl Node {
    /// Everything emitted since the last drain
    pub fn drain(&mut self) -> Vec<ProtocolEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("skein_core=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Small exchange prime keeps handshakes fast
pub fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        exchange_key_bits: 128,
        ..ProtocolConfig::default()
    }
}

pub fn spawn_node(medium: &Arc<LocalMedium>, address: &str, user_id: UserId) -> Node {
    spawn_node_with(
        medium,
        address,
        user_id,
        IdentityKeys::generate(),
        Arc::new(Store::memory()),
    )
}

pub fn spawn_node_with(
    medium: &Arc<LocalMedium>,
    address: &str,
    user_id: UserId,
    identity: IdentityKeys,
    store: Arc<Store>,
) -> Node {
    spawn_node_configured(medium, address, user_id, identity, store, test_config())
}

/// Node whose fragment size differs from the default
pub fn spawn_node_with_payload(
    medium: &Arc<LocalMedium>,
    address: &str,
    user_id: UserId,
    payload_size: usize,
) -> Node {
    let config = ProtocolConfig {
        payload_size,
        ..test_config()
    };
    spawn_node_configured(
        medium,
        address,
        user_id,
        IdentityKeys::generate(),
        Arc::new(Store::memory()),
        config,
    )
}

fn spawn_node_configured(
    medium: &Arc<LocalMedium>,
    address: &str,
    user_id: UserId,
    identity: IdentityKeys,
    store: Arc<Store>,
    config: ProtocolConfig,
) -> Node {
    let (tx, events) = unbounded_channel();
    let manager = LinkManager::new(
        user_id,
        identity,
        config,
        store,
        medium.transport(address),
        Arc::new(tx),
    )
    .expect("valid config");
    medium.attach(address, &manager);
    manager.start().expect("start");
    Node {
        address: address.to_string(),
        manager,
        events,
    }
}

pub fn managers(nodes: &[&Node]) -> Vec<Arc<LinkManager>> {
    nodes.iter().map(|n| n.manager.clone()).collect()
}

/// Nodes in a line, each in range of its neighbours only
pub fn line(medium: &Arc<LocalMedium>, nodes: &[(&str, UserId)]) -> Vec<Node> {
    for pair in nodes.windows(2) {
        medium.set_in_range(pair[0].0, pair[1].0, true);
    }
    nodes
        .iter()
        .map(|(address, user_id)| spawn_node(medium, address, *user_id))
        .collect()
}

pub fn received(events: &[ProtocolEvent]) -> Vec<&skein_core::Message> {
    events
        .iter()
        .filter_map(|e| match e {
            ProtocolEvent::MessageReceived(m) => Some(m),
            _ => None,
        })
        .collect()
}

pub fn broadcasts(events: &[ProtocolEvent]) -> Vec<&skein_core::Message> {
    events
        .iter()
        .filter_map(|e| match e {
            ProtocolEvent::BroadcastReceived(m) => Some(m),
            _ => None,
        })
        .collect()
}

pub fn acks(events: &[ProtocolEvent]) -> Vec<skein_core::MessageId> {
    events
        .iter()
        .filter_map(|e| match e {
            ProtocolEvent::AckReceived(id) => Some(*id),
            _ => None,
        })
        .collect()
}
