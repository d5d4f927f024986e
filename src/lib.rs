//! WolfLAN - Virtual Ethernet LAN over a peer-to-peer overlay
//!
//! Every member exposes a local TAP interface. Frames written to it are
//! forwarded to the right remote member over direct point-to-point streams,
//! and frames arriving from remote members are injected back into the local
//! interface. The result is one layer-2 segment spanning a dynamically
//! discovered set of peers, with no central coordinator.
//!
//! # Architecture
//!
//! A single router task owns the membership table and decides between
//! unicast (by learned hardware address) and broadcast delivery. Per-member
//! tasks move frames over length-prefixed streams opened with a short
//! hardware address handshake. Members are discovered through a rendezvous
//! lookup, a group announcement channel, or incoming overlay connections.
//!
//! # Features
//!
//! - Pluggable overlay substrate (TCP or in-process)
//! - UDP broadcast lookup and group announcements, plus static peers
//! - Linux TAP interfaces with automatic name allocation
//! - Deterministic single-stream-per-pair tie-break

pub mod config;
pub mod discovery;
pub mod error;
pub mod ethernet;
pub mod interface;
pub mod network;
pub mod overlay;
pub mod peer_info;

pub use config::WolfLanConfig;
pub use error::{Error, Result};
pub use peer_info::PeerInfo;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfLanConfig;
    pub use crate::discovery::{Discovery, PubSub};
    pub use crate::error::{Error, Result};
    pub use crate::ethernet::HardwareAddr;
    pub use crate::interface::VirtualInterface;
    pub use crate::network::{Discoverers, NetworkOptions, VirtualNetwork};
    pub use crate::overlay::{Locator, Overlay, PeerId};
    pub use crate::peer_info::PeerInfo;
}
