//! In-Memory Overlay
//!
//! Nodes attached to the same [`MemoryHub`] reach each other through
//! `tokio::io::duplex` pipes. A node can be marked unreachable, in which case
//! connection attempts to it never complete.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc};

use super::{
    BoxStream, InboundStream, Locator, Overlay, OverlayEvent, PeerId, Protocol, EVENT_CAPACITY,
    HANDLER_CAPACITY,
};
use crate::error::{Error, Result};

/// Pipe buffer per direction
const PIPE_CAPACITY: usize = 64 * 1024;

struct Node {
    handlers: HashMap<String, mpsc::Sender<InboundStream>>,
    events: broadcast::Sender<OverlayEvent>,
    connected: HashSet<PeerId>,
    reachable: bool,
}

/// Shared switchboard for in-process overlay nodes
#[derive(Clone, Default)]
pub struct MemoryHub {
    nodes: Arc<Mutex<HashMap<PeerId, Node>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node with a fresh identity
    pub fn node(&self) -> MemoryOverlay {
        let id = PeerId::random();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        self.lock().insert(
            id,
            Node {
                handlers: HashMap::new(),
                events,
                connected: HashSet::new(),
                reachable: true,
            },
        );

        MemoryOverlay { id, hub: self.clone() }
    }

    /// Make connection attempts to `peer` hang (false) or succeed (true)
    pub fn set_reachable(&self, peer: PeerId, reachable: bool) {
        if let Some(node) = self.lock().get_mut(&peer) {
            node.reachable = reachable;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_reachable(&self, peer: PeerId) -> Option<bool> {
        self.lock().get(&peer).map(|n| n.reachable)
    }

    /// Mark the pair as connected, notifying each side on first sight
    fn link(&self, a: PeerId, b: PeerId) {
        let mut nodes = self.lock();
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(node) = nodes.get_mut(&local) {
                if node.connected.insert(remote) {
                    let _ = node.events.send(OverlayEvent::Connected(remote));
                }
            }
        }
    }
}

/// One node on a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryOverlay {
    id: PeerId,
    hub: MemoryHub,
}

impl MemoryOverlay {
    /// The hub this node is attached to
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait::async_trait]
impl Overlay for MemoryOverlay {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn listen_locators(&self) -> Vec<Locator> {
        vec![Locator::new(vec![Protocol::Peer(self.id)])]
    }

    async fn connect(&self, locator: &Locator) -> Result<PeerId> {
        let target = locator
            .peer_id()
            .ok_or_else(|| Error::Format(format!("locator {} has no peer component", locator)))?;

        match self.hub.is_reachable(target) {
            None => Err(Error::ConnectionFailed {
                address: locator.to_string(),
                reason: "no such node".into(),
            }),
            Some(false) => std::future::pending().await,
            Some(true) => {
                self.hub.link(self.id, target);
                Ok(target)
            }
        }
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxStream> {
        let handler = {
            let nodes = self.hub.lock();
            let connected = nodes
                .get(&self.id)
                .is_some_and(|n| n.connected.contains(&peer));
            if !connected {
                return Err(Error::StreamOpen { peer, reason: "not connected".into() });
            }

            let node = nodes.get(&peer).ok_or_else(|| Error::StreamOpen {
                peer,
                reason: "no such node".into(),
            })?;
            if !node.reachable {
                return Err(Error::StreamOpen { peer, reason: "unreachable".into() });
            }
            node.handlers.get(protocol).cloned().ok_or_else(|| Error::StreamOpen {
                peer,
                reason: format!("protocol {} not supported", protocol),
            })?
        };

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = InboundStream {
            peer: self.id,
            stream: Box::new(remote),
        };
        handler.send(inbound).await.map_err(|_| Error::StreamOpen {
            peer,
            reason: "handler closed".into(),
        })?;

        Ok(Box::new(local))
    }

    fn accept_streams(&self, protocol: &str) -> Result<mpsc::Receiver<InboundStream>> {
        let mut nodes = self.hub.lock();
        let node = nodes
            .get_mut(&self.id)
            .ok_or_else(|| Error::Config("node detached from hub".into()))?;
        if node.handlers.get(protocol).is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::Config(format!("protocol {} already has a handler", protocol)));
        }

        let (tx, rx) = mpsc::channel(HANDLER_CAPACITY);
        node.handlers.insert(protocol.to_string(), tx);
        Ok(rx)
    }

    fn remove_stream_handler(&self, protocol: &str) {
        if let Some(node) = self.hub.lock().get_mut(&self.id) {
            node.handlers.remove(protocol);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        let nodes = self.hub.lock();
        match nodes.get(&self.id) {
            Some(node) => node.events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}
