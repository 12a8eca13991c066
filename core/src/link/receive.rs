// Inbound frames: session decryption, reassembly, store-and-forward, acks

use super::state::{Effects, LinkState};
use super::{LinkManager, ProtocolEvent};
use crate::dispatch::Lane;
use crate::frame::{self, parse_ack_ids, BroadcastHeader, FrameType, RelayHeader};
use crate::message::{decode_body, Message};
use crate::store::Block;
use crate::{unix_now, MessageId};
use tracing::{debug, info, warn};

impl LinkManager {
    /// A frame arrived on the link to `address`.
    pub fn on_frame_received(&self, address: &str, raw: &[u8]) {
        let frame_type = frame::decode_type(raw);
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            if frame_type.is_handshake() {
                match frame_type {
                    FrameType::HandshakeRequest => {
                        self.on_handshake_request(&mut state, &mut fx, address, raw)
                    }
                    _ => self.on_handshake_response(&mut state, &mut fx, address, raw),
                }
            } else {
                let Some(device) = state.device_at(address) else {
                    debug!("Dropping {:?} frame from {}: no session", frame_type, address);
                    return;
                };
                let plain = match device.session.decrypt(raw) {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!("Dropping undecryptable frame from {}: {}", address, e);
                        return;
                    }
                };
                self.on_data_frame(&mut state, &mut fx, address, &plain);
            }
        }
        self.apply(fx);
    }

    fn on_data_frame(&self, state: &mut LinkState, fx: &mut Effects, address: &str, frame: &[u8]) {
        match frame::decode_type(frame) {
            FrameType::Message if frame::is_direct(frame) => {
                self.on_direct_fragment(state, fx, address, frame)
            }
            FrameType::Message => self.on_relay_fragment(state, fx, address, frame),
            FrameType::Broadcast => self.on_broadcast_fragment(state, fx, address, frame),
            FrameType::Acknowledgment => self.on_ack_frame(state, fx, address, frame),
            other => debug!("Dropping {:?} frame from {}", other, address),
        }
    }

    fn on_direct_fragment(
        &self,
        state: &mut LinkState,
        fx: &mut Effects,
        address: &str,
        frame: &[u8],
    ) {
        let Some(device) = state.device_at(address) else {
            return;
        };
        let (message_id, seq) = device.session.next_direct_fragment();
        let is_last = frame::is_last(frame);
        if is_last {
            device.session.finish_direct();
        }

        let block = Block {
            message_id,
            seq,
            ttl: 0,
            receiver: Some(self.user_id),
            is_last,
            received_at: unix_now(),
            data: frame::payload(frame).to_vec(),
        };
        if let Err(e) = self.store.blocks.insert(&block) {
            warn!("Cannot store direct fragment: {}", e);
            return;
        }
        if is_last {
            if let Some(message) = self.reconstruct(message_id, false) {
                self.deliver(state, fx, message);
            }
        }
    }

    fn on_relay_fragment(
        &self,
        state: &mut LinkState,
        fx: &mut Effects,
        address: &str,
        frame: &[u8],
    ) {
        let header = match RelayHeader::parse(frame) {
            Ok(header) => header,
            Err(e) => {
                debug!("Bad relay frame from {}: {}", address, e);
                return;
            }
        };
        let block = Block {
            message_id: header.message_id,
            seq: header.seq,
            ttl: 1,
            receiver: Some(header.receiver),
            is_last: header.is_last,
            received_at: unix_now(),
            data: frame::payload(frame).to_vec(),
        };
        match self.store.blocks.insert(&block) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("Cannot store relay fragment: {}", e);
                return;
            }
        }

        if header.receiver == self.user_id {
            if self.store.blocks.is_complete(header.message_id).unwrap_or(false) {
                if let Some(message) = self.reconstruct(header.message_id, false) {
                    self.deliver(state, fx, message);
                }
            }
        } else {
            let peers = state.peer_addresses(Some(address));
            self.queue_to_all(&peers, Lane::Bulk, &[frame.to_vec()]);
        }
    }

    fn on_broadcast_fragment(
        &self,
        state: &mut LinkState,
        fx: &mut Effects,
        address: &str,
        frame: &[u8],
    ) {
        let header = match BroadcastHeader::parse(frame) {
            Ok(header) => header,
            Err(e) => {
                debug!("Bad broadcast frame from {}: {}", address, e);
                return;
            }
        };
        let ttl = header.ttl.saturating_sub(1);
        let block = Block {
            message_id: header.message_id,
            seq: header.seq,
            ttl,
            receiver: None,
            is_last: header.is_last,
            received_at: unix_now(),
            data: frame::payload(frame).to_vec(),
        };
        match self.store.blocks.insert(&block) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("Cannot store broadcast fragment: {}", e);
                return;
            }
        }

        if ttl > 0 {
            match BroadcastHeader::rewrite_ttl(frame, ttl) {
                Ok(forward) => {
                    let peers = state.peer_addresses(Some(address));
                    self.queue_to_all(&peers, Lane::Bulk, &[forward]);
                }
                Err(e) => debug!("Cannot forward broadcast: {}", e),
            }
        }

        if self.store.blocks.is_complete(header.message_id).unwrap_or(false) {
            if let Some(mut message) = self.reconstruct(header.message_id, true) {
                message.ttl = ttl;
                info!(
                    "Broadcast {} from {} received",
                    message.id, message.sender_id
                );
                fx.emit(ProtocolEvent::BroadcastReceived(message));
            }
        }
    }

    fn on_ack_frame(&self, state: &mut LinkState, fx: &mut Effects, address: &str, frame: &[u8]) {
        let ids = match parse_ack_ids(frame) {
            Ok(ids) => ids,
            Err(e) => {
                debug!("Bad ack frame from {}: {}", address, e);
                return;
            }
        };

        let now = unix_now();
        let mut forward = Vec::new();
        for id in ids {
            match self.store.acks.is_waited(id) {
                Ok(true) => {
                    if let Err(e) = self.store.acks.remove(id) {
                        warn!("Cannot clear ack {}: {}", id, e);
                    }
                    info!("Message {} acknowledged", id);
                    fx.emit(ProtocolEvent::AckReceived(id));
                }
                Ok(false) => match self.store.acks.insert(id, false, now) {
                    Ok(true) => forward.push(id),
                    Ok(false) => {}
                    Err(e) => warn!("Cannot record ack {}: {}", id, e),
                },
                Err(e) => warn!("Cannot read ack {}: {}", id, e),
            }
        }

        let peers = state.peer_addresses(Some(address));
        self.queue_acks(&peers, &forward);
    }

    /// Read a complete message back from the store. Failures are logged and
    /// the blocks are kept.
    fn reconstruct(&self, message_id: MessageId, is_broadcast: bool) -> Option<Message> {
        let stream = match self.store.blocks.read_message(message_id) {
            Ok(Some(stream)) => stream,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cannot read message {}: {}", message_id, e);
                return None;
            }
        };
        match decode_body(&stream, is_broadcast, &self.identity) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Cannot reconstruct message {}: {}", message_id, e);
                None
            }
        }
    }

    /// Hand a unicast message to the application and acknowledge it.
    fn deliver(&self, state: &mut LinkState, fx: &mut Effects, message: Message) {
        let id = message.id;
        let sender = message.sender_id;
        info!("Message {} from {} received", id, sender);
        fx.emit(ProtocolEvent::MessageReceived(message));

        match state.address_of(sender).map(str::to_string) {
            Some(address) => self.queue_acks(&[address], &[id]),
            None => {
                if let Err(e) = self.store.acks.insert(id, false, unix_now()) {
                    warn!("Cannot record ack {}: {}", id, e);
                }
                let peers = state.peer_addresses(None);
                self.queue_acks(&peers, &[id]);
            }
        }
    }
}
