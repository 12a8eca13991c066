// Handshake side of the link manager
//
//   Idle ──link up──▶ AwaitingFull ──complete──▶ Completed
//                          │
//                          ├──version mismatch──▶ Incompatible
//                          └──link down──────────▶ Abandoned
//
// The initiator sends its request as soon as the link is up; the acceptor
// answers once the request is fully reassembled.

use super::state::{Effects, LinkAction, LinkState, PendingPeer};
use super::{LinkManager, ProtocolEvent};
use crate::crypto::{ExchangeKeyPair, SessionKey};
use crate::dispatch::Lane;
use crate::frame::{ack_frames, FrameType};
use crate::handshake::Handshake;
use crate::session::Session;
use crate::transport::LinkRole;
use crate::{unix_now, unix_now_ms, SessionId, UserId};
use tracing::{debug, info, warn};

/// What a completed handshake yields
struct Agreement {
    peer_id: UserId,
    session_id: SessionId,
    key: SessionKey,
    identity_key: [u8; 32],
}

impl LinkManager {
    /// A link to `address` is established.
    pub fn on_link_up(&self, address: &str, role: LinkRole) {
        debug!("Link up with {} as {}", address, role);
        match role {
            LinkRole::Initiator => {
                let key_pair = ExchangeKeyPair::generate(self.exchange_params());
                let request = Handshake::request(self.user_id, &self.identity, &key_pair);
                let frames =
                    match request.to_frames(FrameType::HandshakeRequest, self.payload_size()) {
                        Ok(frames) => frames,
                        Err(e) => {
                            warn!("Cannot build handshake request: {}", e);
                            return;
                        }
                    };
                let mut state = self.state.lock();
                let pending = state
                    .pending
                    .entry(address.to_string())
                    .or_insert_with(|| PendingPeer::new(LinkRole::Initiator));
                pending.role = LinkRole::Initiator;
                pending.builder.clear();
                pending.request = Some(request);
                pending.key_pair = Some(key_pair);
                self.queue_to(address, Lane::Priority, frames);
            }
            LinkRole::Acceptor => {
                self.state
                    .lock()
                    .pending
                    .insert(address.to_string(), PendingPeer::new(LinkRole::Acceptor));
            }
        }
    }

    /// Record `address` as incompatible and forget its handshake.
    fn mark_incompatible(&self, state: &mut LinkState, address: &str) {
        info!("Peer at {} is incompatible", address);
        state.incompatible.insert(address.to_string(), unix_now_ms());
        state.pending.remove(address);
    }

    /// Handshake request fragment, we accept.
    pub(super) fn on_handshake_request(
        &self,
        state: &mut LinkState,
        fx: &mut Effects,
        address: &str,
        frame: &[u8],
    ) {
        let live = state
            .pending
            .get(address)
            .map(|p| p.role == LinkRole::Acceptor)
            .unwrap_or(false);
        if !live {
            // Peer is retrying over a link we considered done
            if let Some(user_id) = state.remove_device(address) {
                info!("Device {} restarted its handshake", user_id);
                fx.emit(ProtocolEvent::DeviceLost {
                    user_id,
                    address: address.to_string(),
                });
            }
            state
                .pending
                .insert(address.to_string(), PendingPeer::new(LinkRole::Acceptor));
        }
        let Some(pending) = state.pending.get_mut(address) else {
            return;
        };
        if !pending.builder.push(frame) {
            return;
        }
        let built = pending.builder.build();
        pending.builder.clear();
        let Some(request) = built else {
            debug!("Malformed handshake request from {}", address);
            return;
        };

        let params = match request.exchange_params() {
            Ok(params) => params,
            Err(e) => {
                debug!("Unusable handshake request from {}: {}", address, e);
                self.mark_incompatible(state, address);
                fx.act(LinkAction::Disconnect(address.to_string()));
                return;
            }
        };

        let key_pair = ExchangeKeyPair::generate(&params);
        let response = Handshake::response(request.session_id, self.user_id, &self.identity, &key_pair);
        match response.to_frames(FrameType::HandshakeResponse, self.payload_size()) {
            Ok(frames) => self.queue_to(address, Lane::Priority, frames),
            Err(e) => {
                warn!("Cannot build handshake response: {}", e);
                return;
            }
        }

        match self.agree(&request, &key_pair) {
            Some(agreement) => self.end_handshake(state, fx, address, agreement),
            None => self.mark_incompatible(state, address),
        }
    }

    /// Handshake response fragment, we initiated.
    pub(super) fn on_handshake_response(
        &self,
        state: &mut LinkState,
        fx: &mut Effects,
        address: &str,
        frame: &[u8],
    ) {
        let Some(pending) = state.pending.get_mut(address) else {
            debug!("Unsolicited handshake response from {}", address);
            return;
        };
        if pending.role != LinkRole::Initiator || !pending.builder.push(frame) {
            return;
        }
        let built = pending.builder.build();
        pending.builder.clear();
        let Some(response) = built else {
            debug!("Malformed handshake response from {}", address);
            return;
        };
        let (Some(request), Some(key_pair)) = (pending.request.as_ref(), pending.key_pair.as_ref())
        else {
            return;
        };
        if response.session_id != request.session_id {
            debug!(
                "Ignoring response for session {} from {}, expected {}",
                response.session_id, address, request.session_id
            );
            return;
        }

        match self.agree(&response, key_pair) {
            Some(agreement) => self.end_handshake(state, fx, address, agreement),
            None => {
                self.mark_incompatible(state, address);
                fx.act(LinkAction::Disconnect(address.to_string()));
                self.resume_scan(state, fx);
            }
        }
    }

    /// Check the peer's handshake and derive the session key.
    fn agree(&self, peer: &Handshake, ours: &ExchangeKeyPair) -> Option<Agreement> {
        if !peer.is_version_compatible() {
            info!(
                "Protocol version {} of {} does not match ours",
                peer.version, peer.user_id
            );
            return None;
        }
        if peer.user_id == self.user_id {
            warn!("Peer claims our own user id {}", self.user_id);
            return None;
        }
        let key = peer
            .derive_session_key(ours)
            .map_err(|e| debug!("Key agreement with {} failed: {}", peer.user_id, e))
            .ok()?;
        let identity_key = peer
            .identity_key()
            .map_err(|e| debug!("Bad identity key from {}: {}", peer.user_id, e))
            .ok()?;
        Some(Agreement {
            peer_id: peer.user_id,
            session_id: peer.session_id,
            key,
            identity_key,
        })
    }

    /// Session established: register the device and hand it what we carry.
    fn end_handshake(
        &self,
        state: &mut LinkState,
        fx: &mut Effects,
        address: &str,
        agreement: Agreement,
    ) {
        let Agreement {
            peer_id,
            session_id,
            key,
            identity_key,
        } = agreement;
        state.pending.remove(address);
        self.resume_scan(state, fx);

        if let Some(old) = state.address_of(peer_id).map(str::to_string) {
            if old != address {
                debug!("Device {} moved from {} to {}", peer_id, old, address);
                state.addresses.remove(&old);
                fx.act(LinkAction::Disconnect(old));
            }
        }

        state.devices.insert(
            peer_id,
            super::state::Device {
                address: address.to_string(),
                public_key: identity_key,
                session: Session::new(session_id, self.user_id, peer_id, key),
            },
        );
        state.addresses.insert(address.to_string(), peer_id);

        let now = unix_now();
        if let Err(e) = self.store.devices.upsert(peer_id, identity_key, now) {
            warn!("Cannot store key of device {}: {}", peer_id, e);
        }
        info!("Device {} connected at {}", peer_id, address);
        fx.emit(ProtocolEvent::DeviceConnected {
            user_id: peer_id,
            address: address.to_string(),
        });

        let window = self.config.persistence_window_secs;
        match self.store.acks.sendable(now, window) {
            Ok(ids) if !ids.is_empty() => {
                self.queue_to(address, Lane::Priority, ack_frames(&ids, self.payload_size()))
            }
            Ok(_) => {}
            Err(e) => warn!("Cannot read forwardable acks: {}", e),
        }

        let blocks = match self.store.blocks.sendable(
            self.user_id,
            now,
            window,
            self.config.max_replay_blocks,
        ) {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("Cannot read stored blocks: {}", e);
                return;
            }
        };
        let count = blocks.len();
        for block in blocks {
            self.queues.push(Lane::Bulk, address, block.to_frame());
            if block.receiver == Some(peer_id) {
                if let Err(e) = self.store.blocks.remove(block.message_id, block.seq) {
                    warn!("Cannot remove handed-over block: {}", e);
                }
            }
        }
        if count > 0 {
            debug!("Replaying {} stored blocks to {}", count, peer_id);
        }
    }
}
