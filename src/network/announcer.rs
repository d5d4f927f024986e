//! Group announcements
//!
//! Publishes our [`PeerInfo`] on the network's group channel and turns
//! announcements from others into membership candidates. We re-announce
//! only the first time a hardware address shows up, so a pair of members
//! exchanges at most two rounds and the cycle always ends.

use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::router::{Candidate, Control};
use crate::discovery::Topic;
use crate::ethernet::HardwareAddr;
use crate::overlay::{Locator, PeerId};
use crate::peer_info::PeerInfo;

pub(crate) struct Announcer {
    topic: Box<dyn Topic>,
    local_id: PeerId,
    announcement: Vec<u8>,
    local_address: HardwareAddr,
    seen: HashSet<HardwareAddr>,
}

impl Announcer {
    pub(crate) fn new(topic: Box<dyn Topic>, local_id: PeerId, own: &PeerInfo) -> Self {
        Self {
            topic,
            local_id,
            announcement: own.encode(),
            local_address: own.hardware_address(),
            seen: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self, control: mpsc::Sender<Control>, shutdown: CancellationToken) {
        self.announce().await;

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.topic.next() => match message {
                    Some(message) => message,
                    None => {
                        tracing::debug!("Group channel closed");
                        break;
                    }
                },
            };

            let info = match PeerInfo::decode(&message.data) {
                Ok(info) => info,
                Err(e) => {
                    tracing::debug!("Dropping announcement from {:?}: {}", message.source, e);
                    continue;
                }
            };

            let Some(peer) = self.accept(&info) else {
                continue;
            };
            let Some(locator) = reachable_locator(&info, message.source) else {
                tracing::debug!("Dropping announcement from {} with wildcard locator {}", peer, info.locator());
                continue;
            };
            let first_sight = self.seen.insert(info.hardware_address());

            let candidate = Candidate::announced(peer, info.hardware_address(), locator);
            if control.send(Control::Candidate(candidate)).await.is_err() {
                break;
            }

            if first_sight {
                tracing::debug!("First announcement from {} ({})", peer, info.hardware_address());
                self.announce().await;
            }
        }
    }

    /// Identity of a foreign announcement, None for our own or anonymous ones
    fn accept(&self, info: &PeerInfo) -> Option<PeerId> {
        if info.hardware_address() == self.local_address {
            return None;
        }
        match info.peer_id() {
            Some(peer) if peer != self.local_id => Some(peer),
            Some(_) => None,
            None => {
                tracing::debug!("Announcement for {} carries no identity", info.hardware_address());
                None
            }
        }
    }

    async fn announce(&self) {
        if let Err(e) = self.topic.publish(&self.announcement).await {
            tracing::warn!("Failed to announce: {}", e);
        }
    }
}

/// Locator to dial for an announcement. Members bound to a wildcard address
/// announce it as is; the datagram's sender tells us where they really are.
fn reachable_locator(info: &PeerInfo, source: Option<SocketAddr>) -> Option<Locator> {
    let locator = info.locator();
    if !locator.is_unspecified() {
        return Some(locator.clone());
    }
    source.map(|source| locator.resolve_unspecified(source.ip()))
}
