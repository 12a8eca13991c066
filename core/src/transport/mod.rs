//! Link layer abstraction.
//!
//! The engine never talks to a radio directly. A [`Transport`] carries out
//! its requests (connect, write a frame, scan) and the host reports link
//! events back through [`LinkListener`].

pub mod local;

pub use local::{LocalMedium, LocalTransport};

use crate::UserId;
use std::fmt;
use thiserror::Error;

/// Largest write a BLE characteristic accepts
pub const DEFAULT_MAX_FRAME: usize = 512;

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// We connected to the peer and speak first
    Initiator,
    /// The peer connected to us
    Acceptor,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Initiator => write!(f, "initiator"),
            LinkRole::Acceptor => write!(f, "acceptor"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No link to {0}")]
    NotConnected(String),
    #[error("Write to {0} failed: {1}")]
    WriteFailed(String, String),
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound side of the link layer
pub trait Transport: Send + Sync {
    /// Open a link. Completion is reported through
    /// [`LinkListener::on_link_up`].
    fn connect(&self, address: &str) -> Result<(), TransportError>;

    fn disconnect(&self, address: &str);

    /// Write one frame and wait for the write to complete.
    fn send_frame(&self, address: &str, frame: &[u8]) -> Result<(), TransportError>;

    /// Largest frame a single write may carry
    fn max_payload_size(&self) -> usize {
        DEFAULT_MAX_FRAME
    }

    /// Make ourselves discoverable as `user_id`.
    fn advertise(&self, _user_id: UserId) -> Result<(), TransportError> {
        Ok(())
    }

    fn start_scan(&self) {}

    fn stop_scan(&self) {}
}

/// Inbound side of the link layer
pub trait LinkListener: Send + Sync {
    fn on_peer_discovered(&self, address: &str, user_id: UserId);
    fn on_link_up(&self, address: &str, role: LinkRole);
    fn on_link_down(&self, address: &str);
    fn on_frame_received(&self, address: &str, frame: &[u8]);
}
