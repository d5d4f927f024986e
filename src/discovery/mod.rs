//! Discovery Module
//!
//! How members of a virtual network find each other. Two kinds of
//! collaborator are supported:
//!
//! - [`Discovery`]: a rendezvous lookup. Advertise under the network name,
//!   then ask who else is there.
//! - [`PubSub`]: a group channel named after the network on which members
//!   announce their [`crate::PeerInfo`].

mod broadcast;
mod memory;
mod static_peers;

pub use broadcast::{
    BroadcastDiscovery, BroadcastPubSub, BroadcastTopic, DEFAULT_GROUP_PORT, DEFAULT_LOOKUP_PORT,
};
pub use memory::{MemoryDiscovery, MemoryPubSub, MemoryRendezvous, MemoryTopic};
pub use static_peers::{CombinedDiscovery, StaticDiscovery};

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::Result;
use crate::overlay::Locator;

/// Rendezvous-style peer lookup
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Make this node findable under `namespace`
    async fn advertise(&self, namespace: &str) -> Result<()>;

    /// Locators of the nodes currently advertised under `namespace`.
    /// The result may include this node.
    async fn find_peers(&self, namespace: &str) -> Result<Vec<Locator>>;
}

/// One message received on a group channel
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub data: Bytes,
    /// Network origin, when the channel knows it
    pub source: Option<SocketAddr>,
}

/// Group messaging channel factory
#[async_trait::async_trait]
pub trait PubSub: Send + Sync {
    async fn join(&self, topic: &str) -> Result<Box<dyn Topic>>;
}

/// A joined group channel. Publishers may receive their own messages.
#[async_trait::async_trait]
pub trait Topic: Send + Sync {
    async fn publish(&self, data: &[u8]) -> Result<()>;

    /// Next message, or `None` once the channel is gone
    async fn next(&mut self) -> Option<GroupMessage>;
}
