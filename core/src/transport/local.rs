//! In-process link layer.
//!
//! A [`LocalMedium`] stands in for the radio: nodes attach under an address,
//! the test decides who is in range of whom, and every link event or frame
//! is queued and delivered only when asked. That keeps multi-node runs
//! deterministic.

use super::{LinkListener, LinkRole, Transport, TransportError, DEFAULT_MAX_FRAME};
use crate::link::LinkManager;
use crate::UserId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Upper bound on delivery rounds in [`LocalMedium::run_until_idle`]
const MAX_ROUNDS: usize = 100_000;

type Pair = (String, String);

fn pair(a: &str, b: &str) -> Pair {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Debug)]
enum Delivery {
    Discovered { to: String, from: String, user_id: UserId },
    LinkUp { to: String, peer: String, role: LinkRole },
    LinkDown { to: String, peer: String },
    Frame { to: String, from: String, bytes: Vec<u8> },
}

impl Delivery {
    fn target(&self) -> &str {
        match self {
            Delivery::Discovered { to, .. }
            | Delivery::LinkUp { to, .. }
            | Delivery::LinkDown { to, .. }
            | Delivery::Frame { to, .. } => to,
        }
    }
}

#[derive(Default)]
struct Node {
    listener: Option<Weak<dyn LinkListener>>,
    user_id: Option<UserId>,
    scanning: bool,
}

#[derive(Default)]
struct MediumState {
    nodes: BTreeMap<String, Node>,
    in_range: BTreeSet<Pair>,
    links: BTreeSet<Pair>,
    queue: VecDeque<Delivery>,
    frames_delivered: usize,
}

pub struct LocalMedium {
    state: Mutex<MediumState>,
    max_frame: usize,
}

impl LocalMedium {
    pub fn new() -> Arc<Self> {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MediumState::default()),
            max_frame,
        })
    }

    /// Transport handle for the node at `address`.
    pub fn transport(self: &Arc<Self>, address: &str) -> Arc<LocalTransport> {
        self.state.lock().nodes.entry(address.to_string()).or_default();
        Arc::new(LocalTransport {
            medium: Arc::clone(self),
            address: address.to_string(),
        })
    }

    /// Route link events for `address` to `listener`.
    pub fn attach<L: LinkListener + 'static>(&self, address: &str, listener: &Arc<L>) {
        let listener: Arc<dyn LinkListener> = listener.clone();
        self.state
            .lock()
            .nodes
            .entry(address.to_string())
            .or_default()
            .listener = Some(Arc::downgrade(&listener));
    }

    /// Put two nodes in or out of radio range. Leaving range drops the link.
    pub fn set_in_range(&self, a: &str, b: &str, in_range: bool) {
        let key = pair(a, b);
        let mut state = self.state.lock();
        if in_range {
            state.in_range.insert(key);
        } else {
            state.in_range.remove(&key);
            if state.links.remove(&key) {
                Self::queue_link_down(&mut state, a, b);
            }
        }
    }

    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        self.state.lock().links.contains(&pair(a, b))
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn frames_delivered(&self) -> usize {
        self.state.lock().frames_delivered
    }

    fn queue_link_down(state: &mut MediumState, a: &str, b: &str) {
        state.queue.push_back(Delivery::LinkDown {
            to: a.to_string(),
            peer: b.to_string(),
        });
        state.queue.push_back(Delivery::LinkDown {
            to: b.to_string(),
            peer: a.to_string(),
        });
    }

    /// Let every scanning node see the advertising nodes in its range.
    pub fn discover(&self) {
        let mut state = self.state.lock();
        let mut found = Vec::new();
        for (scanner, node) in &state.nodes {
            if !node.scanning {
                continue;
            }
            for (advertiser, other) in &state.nodes {
                let Some(user_id) = other.user_id else {
                    continue;
                };
                let key = pair(scanner, advertiser);
                if scanner != advertiser
                    && state.in_range.contains(&key)
                    && !state.links.contains(&key)
                {
                    found.push(Delivery::Discovered {
                        to: scanner.clone(),
                        from: advertiser.clone(),
                        user_id,
                    });
                }
            }
        }
        state.queue.extend(found);
    }

    /// Deliver one queued event. Returns `false` when the queue is empty.
    pub fn deliver_next(&self) -> bool {
        let (delivery, listener) = {
            let mut state = self.state.lock();
            let Some(delivery) = state.queue.pop_front() else {
                return false;
            };
            if let Delivery::Frame { to, from, .. } = &delivery {
                if !state.links.contains(&pair(to, from)) {
                    debug!("Frame {} → {} lost with its link", from, to);
                    return true;
                }
                state.frames_delivered += 1;
            }
            let listener = state
                .nodes
                .get(delivery.target())
                .and_then(|n| n.listener.as_ref())
                .and_then(Weak::upgrade);
            (delivery, listener)
        };

        let Some(listener) = listener else {
            return true;
        };
        match delivery {
            Delivery::Discovered { from, user_id, .. } => {
                listener.on_peer_discovered(&from, user_id)
            }
            Delivery::LinkUp { peer, role, .. } => listener.on_link_up(&peer, role),
            Delivery::LinkDown { peer, .. } => listener.on_link_down(&peer),
            Delivery::Frame { from, bytes, .. } => listener.on_frame_received(&from, &bytes),
        }
        true
    }

    /// Deliver until the queue is empty. Returns how many events went out.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        while self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    /// Alternate between draining every manager's send queue and delivering
    /// events until nothing moves. Returns the number of rounds.
    pub fn run_until_idle(&self, managers: &[Arc<LinkManager>]) -> usize {
        for round in 0..MAX_ROUNDS {
            let mut progressed = false;
            for manager in managers {
                while manager.pump() {
                    progressed = true;
                }
            }
            if self.deliver_all() > 0 {
                progressed = true;
            }
            if !progressed {
                return round;
            }
        }
        MAX_ROUNDS
    }

    /// Discover and run until no new link forms.
    pub fn settle(&self, managers: &[Arc<LinkManager>]) {
        loop {
            let links = self.link_count();
            self.discover();
            self.run_until_idle(managers);
            if self.link_count() == links {
                break;
            }
        }
    }
}

/// One node's view of a [`LocalMedium`]
pub struct LocalTransport {
    medium: Arc<LocalMedium>,
    address: String,
}

impl LocalTransport {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Transport for LocalTransport {
    fn connect(&self, address: &str) -> Result<(), TransportError> {
        let key = pair(&self.address, address);
        let mut state = self.medium.state.lock();
        if !state.in_range.contains(&key) {
            return Err(TransportError::Unavailable(format!("{} out of range", address)));
        }
        if !state.links.insert(key) {
            return Ok(());
        }
        state.queue.push_back(Delivery::LinkUp {
            to: self.address.clone(),
            peer: address.to_string(),
            role: LinkRole::Initiator,
        });
        state.queue.push_back(Delivery::LinkUp {
            to: address.to_string(),
            peer: self.address.clone(),
            role: LinkRole::Acceptor,
        });
        Ok(())
    }

    fn disconnect(&self, address: &str) {
        let mut state = self.medium.state.lock();
        if state.links.remove(&pair(&self.address, address)) {
            LocalMedium::queue_link_down(&mut state, &self.address, address);
        }
    }

    fn send_frame(&self, address: &str, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.medium.max_frame {
            return Err(TransportError::WriteFailed(
                address.to_string(),
                format!("{} byte frame exceeds {}", frame.len(), self.medium.max_frame),
            ));
        }
        let mut state = self.medium.state.lock();
        if !state.links.contains(&pair(&self.address, address)) {
            return Err(TransportError::NotConnected(address.to_string()));
        }
        state.queue.push_back(Delivery::Frame {
            to: address.to_string(),
            from: self.address.clone(),
            bytes: frame.to_vec(),
        });
        Ok(())
    }

    fn max_payload_size(&self) -> usize {
        self.medium.max_frame
    }

    fn advertise(&self, user_id: UserId) -> Result<(), TransportError> {
        self.medium
            .state
            .lock()
            .nodes
            .entry(self.address.clone())
            .or_default()
            .user_id = Some(user_id);
        Ok(())
    }

    fn start_scan(&self) {
        if let Some(node) = self.medium.state.lock().nodes.get_mut(&self.address) {
            node.scanning = true;
        }
    }

    fn stop_scan(&self) {
        if let Some(node) = self.medium.state.lock().nodes.get_mut(&self.address) {
            node.scanning = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl LinkListener for Recorder {
        fn on_peer_discovered(&self, address: &str, user_id: UserId) {
            self.log.lock().push(format!("discovered {} {}", address, user_id));
        }
        fn on_link_up(&self, address: &str, role: LinkRole) {
            self.log.lock().push(format!("up {} {}", address, role));
        }
        fn on_link_down(&self, address: &str) {
            self.log.lock().push(format!("down {}", address));
        }
        fn on_frame_received(&self, address: &str, frame: &[u8]) {
            self.log.lock().push(format!("frame {} {:?}", address, frame));
        }
    }

    #[test]
    fn test_link_lifecycle() {
        let medium = LocalMedium::new();
        let a = medium.transport("a");
        let b = medium.transport("b");
        let ra = Arc::new(Recorder::default());
        let rb = Arc::new(Recorder::default());
        medium.attach("a", &ra);
        medium.attach("b", &rb);

        assert!(a.connect("b").is_err());
        medium.set_in_range("a", "b", true);
        a.connect("b").unwrap();
        a.send_frame("b", &[1, 2]).unwrap();
        b.send_frame("a", &[3]).unwrap();
        medium.deliver_all();

        assert_eq!(*ra.log.lock(), vec!["up b initiator", "frame b [3]"]);
        assert_eq!(*rb.log.lock(), vec!["up a acceptor", "frame a [1, 2]"]);

        medium.set_in_range("a", "b", false);
        medium.deliver_all();
        assert_eq!(ra.log.lock().last().unwrap(), "down b");
        assert_eq!(
            a.send_frame("b", &[1]),
            Err(TransportError::NotConnected("b".into()))
        );
    }

    #[test]
    fn test_discovery_requires_scan_and_advert() {
        let medium = LocalMedium::new();
        let a = medium.transport("a");
        let b = medium.transport("b");
        let ra = Arc::new(Recorder::default());
        medium.attach("a", &ra);
        medium.set_in_range("a", "b", true);

        a.start_scan();
        medium.discover();
        medium.deliver_all();
        assert!(ra.log.lock().is_empty());

        b.advertise(20).unwrap();
        medium.discover();
        medium.deliver_all();
        assert_eq!(*ra.log.lock(), vec!["discovered b 20"]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let medium = LocalMedium::with_max_frame(8);
        let a = medium.transport("a");
        medium.transport("b");
        medium.set_in_range("a", "b", true);
        a.connect("b").unwrap();
        assert!(matches!(
            a.send_frame("b", &[0u8; 9]),
            Err(TransportError::WriteFailed(..))
        ));
    }
}
