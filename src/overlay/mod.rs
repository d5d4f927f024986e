//! Overlay Module
//!
//! The peer-to-peer substrate the virtual LAN runs on: identities,
//! locators, connection establishment and protocol streams.
//!
//! Two substrates are provided. [`TcpOverlay`] carries every stream on its
//! own TCP connection; [`MemoryOverlay`] links nodes living in the same
//! process through in-memory pipes.

mod locator;
mod memory;
mod tcp;

pub use locator::{Locator, Protocol};
pub use memory::{MemoryHub, MemoryOverlay};
pub use tcp::TcpOverlay;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Capacity of the overlay event channel
pub(crate) const EVENT_CAPACITY: usize = 64;

/// Capacity of a protocol handler's inbound stream queue
pub(crate) const HANDLER_CAPACITY: usize = 32;

/// Overlay-assigned identity of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Size of the binary encoding
    pub const SIZE: usize = 16;

    /// Generate a fresh identity
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Format(format!("invalid peer id {}: {}", s, e)))
    }
}

/// A bidirectional byte stream to a remote peer
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed protocol stream handed out by an overlay
pub type BoxStream = Box<dyn AsyncStream>;

/// A stream opened by a remote peer for a registered protocol
pub struct InboundStream {
    /// Identity of the opening peer
    pub peer: PeerId,
    /// The stream itself
    pub stream: BoxStream,
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Connection-level notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEvent {
    /// A previously unknown peer became reachable
    Connected(PeerId),
    /// A known peer could no longer be dialled
    Disconnected(PeerId),
}

/// Peer-to-peer substrate used by the virtual network
#[async_trait::async_trait]
pub trait Overlay: Send + Sync {
    /// This node's identity
    fn local_id(&self) -> PeerId;

    /// Locators other nodes can use to reach this node
    fn listen_locators(&self) -> Vec<Locator>;

    /// Establish an overlay connection, returning the remote identity.
    /// Callers bound this with their own timeout.
    async fn connect(&self, locator: &Locator) -> Result<PeerId>;

    /// Open a protocol stream to an already known peer
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxStream>;

    /// Register a handler for inbound streams of `protocol`
    fn accept_streams(&self, protocol: &str) -> Result<mpsc::Receiver<InboundStream>>;

    /// Drop the handler registered for `protocol`
    fn remove_stream_handler(&self, protocol: &str);

    /// Subscribe to connection events
    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent>;
}
