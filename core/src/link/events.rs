// Events surfaced to the application

use crate::message::Message;
use crate::{MessageId, UserId};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Handshake finished, a session is up
    DeviceConnected { user_id: UserId, address: String },
    /// The link to a connected device went away
    DeviceLost { user_id: UserId, address: String },
    /// A unicast message addressed to us was reassembled
    MessageReceived(Message),
    /// A broadcast was reassembled
    BroadcastReceived(Message),
    /// The receiver acknowledged one of our messages
    AckReceived(MessageId),
}

/// Where the link manager delivers [`ProtocolEvent`]s.
///
/// Called without any internal lock held.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProtocolEvent);
}

impl EventSink for UnboundedSender<ProtocolEvent> {
    fn emit(&self, event: ProtocolEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Sink that drops everything
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ProtocolEvent) {}
}
