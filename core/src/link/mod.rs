//! Link manager: the protocol engine.
//!
//! Owns every link's handshake and session, feeds the send queues, and
//! turns inbound frames into store updates, propagation and events.
//!
//! Device, session and pending tables sit behind one coarse lock. Transport
//! calls and event delivery happen only after it is released.
//!
//! Frames leave through [`LinkManager::spawn_sender`] (a dedicated thread) or
//! through [`LinkManager::pump`] when the host wants to drive sending itself.
//! Use one or the other, never both.

mod events;
mod handshake;
mod receive;
mod state;

pub use events::{EventSink, NullSink, ProtocolEvent};

use crate::config::{ConfigError, ProtocolConfig, SESSION_TAG_SIZE};
use crate::crypto::{ExchangeParams, IdentityKeys};
use crate::dispatch::{Lane, OutboundFrame, SendQueues};
use crate::frame::{self, ack_frames};
use crate::message::{encode_body, fragment, FrameKind, Message};
use crate::store::{Block, Store, StoreError};
use crate::transport::{LinkListener, LinkRole, Transport, TransportError};
use crate::{unix_now, unix_now_ms, MessageId, SendError, UserId};
use parking_lot::Mutex;
use state::{Effects, LinkAction, LinkState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of a garbage collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub blocks_removed: usize,
    pub acks_removed: usize,
    pub incompatible_released: usize,
}

pub struct LinkManager {
    user_id: UserId,
    identity: IdentityKeys,
    config: ProtocolConfig,
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventSink>,
    state: Mutex<LinkState>,
    queues: SendQueues,
    /// Domain parameters offered in our handshake requests, generated once
    exchange_params: OnceLock<ExchangeParams>,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl LinkManager {
    pub fn new(
        user_id: UserId,
        identity: IdentityKeys,
        config: ProtocolConfig,
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let manager = Arc::new(Self {
            user_id,
            identity,
            config,
            store,
            transport,
            events,
            state: Mutex::new(LinkState::default()),
            queues: SendQueues::new(),
            exchange_params: OnceLock::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        match manager.collect_garbage(unix_now()) {
            Ok(report) => debug!("Startup cleanup: {:?}", report),
            Err(e) => warn!("Startup cleanup failed: {}", e),
        }
        Ok(manager)
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn identity(&self) -> &IdentityKeys {
        &self.identity
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Advertise and start scanning for peers.
    pub fn start(&self) -> Result<(), TransportError> {
        self.transport.advertise(self.user_id)?;
        self.started.store(true, Ordering::SeqCst);
        self.shutdown.store(false, Ordering::SeqCst);
        let start_scan = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.scanning, true)
        };
        if start_scan {
            self.transport.start_scan();
        }
        info!("Link manager {} started", self.user_id);
        Ok(())
    }

    /// Stop scanning, drop every link and stop the sender thread.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        let addresses: Vec<String> = {
            let mut state = self.state.lock();
            state.scanning = false;
            state
                .addresses
                .keys()
                .chain(state.pending.keys())
                .cloned()
                .collect()
        };
        self.transport.stop_scan();
        for address in addresses {
            self.transport.disconnect(&address);
            self.on_link_down(&address);
        }
        self.queues.wake();
        info!("Link manager {} stopped", self.user_id);
    }

    /// Run the sender loop on its own thread until [`LinkManager::stop`].
    pub fn spawn_sender(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("skein-sender-{}", self.user_id))
            .spawn(move || {
                let idle = manager.config.sender_idle_wait();
                while !manager.shutdown.load(Ordering::SeqCst) {
                    if let Some(item) = manager.queues.pop_timeout(idle) {
                        manager.transmit(item);
                    }
                }
                debug!("Sender {} exiting", manager.user_id);
            })
    }

    /// Transmit one queued frame. Returns `false` when nothing was queued.
    pub fn pump(&self) -> bool {
        match self.queues.try_pop() {
            Some(item) => {
                self.transmit(item);
                true
            }
            None => false,
        }
    }

    /// Frames waiting in the send queues
    pub fn queued_frames(&self) -> usize {
        self.queues.len()
    }

    /// Users with an established session
    pub fn connected_devices(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.state.lock().devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.state.lock().devices.contains_key(&user_id)
    }

    pub(crate) fn payload_size(&self) -> usize {
        self.config
            .effective_payload_size(self.transport.max_payload_size())
    }

    /// Largest plain frame that still fits one link write once sealed
    fn frame_limit(&self) -> usize {
        self.transport
            .max_payload_size()
            .saturating_sub(SESSION_TAG_SIZE)
    }

    fn exchange_params(&self) -> &ExchangeParams {
        self.exchange_params
            .get_or_init(|| ExchangeParams::generate(self.config.exchange_key_bits))
    }

    fn apply(&self, effects: Effects) {
        for action in effects.actions {
            match action {
                LinkAction::Connect(address) => {
                    if let Err(e) = self.transport.connect(&address) {
                        warn!("Connecting to {} failed: {}", address, e);
                        self.on_link_down(&address);
                    }
                }
                LinkAction::Disconnect(address) => self.transport.disconnect(&address),
                LinkAction::StartScan => self.transport.start_scan(),
                LinkAction::StopScan => self.transport.stop_scan(),
            }
        }
        for event in effects.events {
            self.events.emit(event);
        }
    }

    fn queue_to(&self, address: &str, lane: Lane, frames: Vec<Vec<u8>>) {
        for frame in frames {
            self.queues.push(lane, address, frame);
        }
    }

    fn queue_to_all(&self, addresses: &[String], lane: Lane, frames: &[Vec<u8>]) {
        for address in addresses {
            for frame in frames {
                self.queues.push(lane, address, frame.clone());
            }
        }
    }

    fn queue_acks(&self, addresses: &[String], ids: &[MessageId]) {
        if ids.is_empty() {
            return;
        }
        let frames = ack_frames(ids, self.payload_size());
        self.queue_to_all(addresses, Lane::Priority, &frames);
    }

    /// Session-encrypt (when applicable) and write one frame.
    fn transmit(&self, item: OutboundFrame) {
        let OutboundFrame { address, frame } = item;
        // Forwarded frames keep the originator's fragment size, so only the
        // link itself bounds them
        let limit = self.frame_limit();
        if frame.len() > limit {
            warn!(
                "Dropping {} byte frame for {}: link carries at most {}",
                frame.len(),
                address,
                limit
            );
            return;
        }

        let wire = if frame::decode_type(&frame).is_handshake() {
            frame
        } else {
            let mut state = self.state.lock();
            let Some(device) = state.device_at(&address) else {
                debug!("Dropping frame for {}: no session", address);
                return;
            };
            match device.session.encrypt(&frame) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!("Session encryption for {} failed: {}", address, e);
                    return;
                }
            }
        };

        if let Err(e) = self.transport.send_frame(&address, &wire) {
            warn!("{}", e);
            self.on_write_failed(&address);
        }
    }

    /// A write failed: the link is considered dead.
    pub fn on_write_failed(&self, address: &str) {
        self.transport.disconnect(address);
        self.on_link_down(address);
    }

    // ------------------------------------------------------------------
    // Send API
    // ------------------------------------------------------------------

    /// Send to `message.receiver_id`: directly when connected, otherwise as
    /// a relay message through every connected peer.
    pub fn send_message(&self, message: Message) -> Result<MessageId, SendError> {
        let receiver = self.check_unicast(&message)?;
        if self.is_connected(receiver) {
            self.send_direct(message, receiver)
        } else {
            self.send_relay(message, receiver)
        }
    }

    /// Send only if the receiver is connected right now.
    pub fn send_direct_message(&self, message: Message) -> Result<MessageId, SendError> {
        let receiver = self.check_unicast(&message)?;
        self.send_direct(message, receiver)
    }

    /// Flood `message` to everyone within `ttl` hops.
    pub fn send_broadcast(&self, mut message: Message, ttl: u8) -> Result<MessageId, SendError> {
        if !self.is_started() {
            return Err(SendError::NotStarted);
        }
        if ttl == 0 {
            return Err(SendError::InvalidTtl);
        }
        message.sender_id = self.user_id;
        message.receiver_id = None;
        message.ttl = ttl;

        let stream = encode_body(&message, None, false, self.config.compression_level)?;
        let fragments = fragment(
            &stream,
            FrameKind::Broadcast { ttl },
            message.id,
            self.payload_size(),
        )?;

        let now = unix_now();
        let mut frames = Vec::with_capacity(fragments.len());
        for f in fragments {
            self.store.blocks.insert(&Block {
                message_id: message.id,
                seq: f.seq,
                ttl,
                receiver: None,
                is_last: f.is_last,
                received_at: now,
                data: f.data().to_vec(),
            })?;
            frames.push(f.frame);
        }

        let peers = self.state.lock().peer_addresses(None);
        self.queue_to_all(&peers, Lane::Bulk, &frames);
        info!(
            "Broadcast {} queued: {} frames, ttl {}, {} peers",
            message.id,
            frames.len(),
            ttl,
            peers.len()
        );
        Ok(message.id)
    }

    fn check_unicast(&self, message: &Message) -> Result<UserId, SendError> {
        if !self.is_started() {
            return Err(SendError::NotStarted);
        }
        let receiver = message.receiver_id.ok_or(SendError::ReceiverEmpty)?;
        if receiver == self.user_id {
            return Err(SendError::SelfReceiver);
        }
        Ok(receiver)
    }

    fn send_direct(&self, mut message: Message, receiver: UserId) -> Result<MessageId, SendError> {
        message.sender_id = self.user_id;
        let (address, public_key) = {
            let state = self.state.lock();
            let device = state.devices.get(&receiver).ok_or(SendError::OutOfRange)?;
            (device.address.clone(), device.public_key)
        };

        let stream = encode_body(
            &message,
            Some(&public_key),
            self.config.encryption,
            self.config.compression_level,
        )?;
        let fragments = fragment(&stream, FrameKind::Direct, message.id, self.payload_size())?;
        self.store.acks.insert(message.id, true, unix_now())?;

        let count = fragments.len();
        self.queue_to(
            &address,
            Lane::Bulk,
            fragments.into_iter().map(|f| f.frame).collect(),
        );
        debug!("Direct message {} to {}: {} frames", message.id, receiver, count);
        Ok(message.id)
    }

    fn send_relay(&self, mut message: Message, receiver: UserId) -> Result<MessageId, SendError> {
        message.sender_id = self.user_id;
        let public_key = self
            .store
            .devices
            .public_key(receiver)?
            .ok_or(SendError::UnknownReceiver(receiver))?;

        let stream = encode_body(
            &message,
            Some(&public_key),
            self.config.encryption,
            self.config.compression_level,
        )?;
        let fragments = fragment(
            &stream,
            FrameKind::Relay { receiver },
            message.id,
            self.payload_size(),
        )?;

        let now = unix_now();
        let mut frames = Vec::with_capacity(fragments.len());
        for f in fragments {
            self.store.blocks.insert(&Block {
                message_id: message.id,
                seq: f.seq,
                ttl: 1,
                receiver: Some(receiver),
                is_last: f.is_last,
                received_at: now,
                data: f.data().to_vec(),
            })?;
            frames.push(f.frame);
        }
        self.store.acks.insert(message.id, true, now)?;

        let peers = self.state.lock().peer_addresses(None);
        self.queue_to_all(&peers, Lane::Bulk, &frames);
        debug!(
            "Relay message {} for {}: {} frames via {} peers",
            message.id,
            receiver,
            frames.len(),
            peers.len()
        );
        Ok(message.id)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Register a device key learned out of band so relay messages can be
    /// encrypted for it. Returns `true` if the stored key changed.
    pub fn add_device(&self, user_id: UserId, public_key: [u8; 32]) -> Result<bool, StoreError> {
        self.store.devices.upsert(user_id, public_key, unix_now())
    }

    /// Drop expired or delivered blocks, expired acks, and incompatibility
    /// marks whose cool-down elapsed.
    pub fn collect_garbage(&self, now: u64) -> Result<GcReport, StoreError> {
        let window = self.config.persistence_window_secs;
        let mut report = GcReport::default();

        for (message_id, seq) in self.store.blocks.removable(self.user_id, now, window)? {
            self.store.blocks.remove(message_id, seq)?;
            report.blocks_removed += 1;
        }
        report.acks_removed = self.store.acks.remove_expired(now, window)?;

        let now_ms = now.saturating_mul(1000);
        let cooldown = self.config.incompatibility_timeout_ms;
        let mut state = self.state.lock();
        let before = state.incompatible.len();
        state
            .incompatible
            .retain(|_, since| now_ms.saturating_sub(*since) < cooldown);
        report.incompatible_released = before - state.incompatible.len();

        if report != GcReport::default() {
            debug!("Garbage collection: {:?}", report);
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------

    /// The scanner saw `user_id` advertising at `address`.
    ///
    /// Only the side with the smaller user id connects.
    pub fn on_peer_discovered(&self, address: &str, user_id: UserId) {
        if !self.is_started() || user_id <= self.user_id {
            return;
        }
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            if state.devices.contains_key(&user_id)
                || state.is_known(
                    address,
                    unix_now_ms(),
                    self.config.incompatibility_timeout_ms,
                )
            {
                return;
            }
            debug!("Connecting to {} at {}", user_id, address);
            state
                .pending
                .insert(address.to_string(), state::PendingPeer::new(LinkRole::Initiator));
            if std::mem::replace(&mut state.scanning, false) {
                fx.act(LinkAction::StopScan);
            }
            fx.act(LinkAction::Connect(address.to_string()));
        }
        self.apply(fx);
    }

    /// The link to `address` is gone.
    pub fn on_link_down(&self, address: &str) {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let was_pending = state.pending.remove(address).is_some();
            if let Some(user_id) = state.remove_device(address) {
                info!("Device {} lost ({})", user_id, address);
                fx.emit(ProtocolEvent::DeviceLost {
                    user_id,
                    address: address.to_string(),
                });
            } else if !was_pending {
                return;
            }
            self.resume_scan(&mut state, &mut fx);
        }
        self.queues.purge(address);
        self.apply(fx);
    }

    fn resume_scan(&self, state: &mut LinkState, fx: &mut Effects) {
        if self.is_started() && !std::mem::replace(&mut state.scanning, true) {
            fx.act(LinkAction::StartScan);
        }
    }
}

impl LinkListener for LinkManager {
    fn on_peer_discovered(&self, address: &str, user_id: UserId) {
        LinkManager::on_peer_discovered(self, address, user_id)
    }

    fn on_link_up(&self, address: &str, role: LinkRole) {
        LinkManager::on_link_up(self, address, role)
    }

    fn on_link_down(&self, address: &str) {
        LinkManager::on_link_down(self, address)
    }

    fn on_frame_received(&self, address: &str, frame: &[u8]) {
        LinkManager::on_frame_received(self, address, frame)
    }
}
