//! UDP Broadcast Discovery
//!
//! Finds members on the same subnet. Advertised nodes periodically broadcast
//! their locator; a lookup listens for a scan window and collects what it
//! hears. The group channel rides on the same mechanism with a binary
//! datagram format.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{Discovery, GroupMessage, PubSub, Topic};
use crate::error::{Error, Result};
use crate::overlay::{Locator, PeerId};

/// Default lookup port
pub const DEFAULT_LOOKUP_PORT: u16 = 9610;

/// Default group channel port
pub const DEFAULT_GROUP_PORT: u16 = 9611;

/// Broadcast interval
const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// How long a lookup listens by default
const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

/// Lookup message prefix
const DISCOVERY_PREFIX: &str = "WOLFLAN";

/// Lookup message version
const DISCOVERY_VERSION: u8 = 1;

/// Group datagram prefix
const GROUP_PREFIX: &[u8] = b"WOLFLAN-GRP|";

/// Largest datagram we expect to receive
const MAX_DATAGRAM: usize = 2048;

/// UDP broadcast rendezvous
pub struct BroadcastDiscovery {
    local_id: PeerId,
    locators: Vec<Locator>,
    port: u16,
    target: IpAddr,
    scan_window: Duration,
    advertiser: Mutex<Option<CancellationToken>>,
}

impl BroadcastDiscovery {
    /// Advertise `locators` as node `local_id` on `port`
    pub fn new(local_id: PeerId, locators: Vec<Locator>, port: u16) -> Self {
        Self {
            local_id,
            locators,
            port,
            target: IpAddr::V4(Ipv4Addr::BROADCAST),
            scan_window: DEFAULT_SCAN_WINDOW,
            advertiser: Mutex::new(None),
        }
    }

    /// How long `find_peers` listens
    pub fn with_scan_window(mut self, scan_window: Duration) -> Self {
        self.scan_window = scan_window;
        self
    }

    /// Send to `target` instead of the limited broadcast address
    pub fn with_target(mut self, target: IpAddr) -> Self {
        self.target = target;
        self
    }

    /// Stop advertising
    pub fn stop(&self) {
        if let Some(token) = self.advertiser.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }
}

impl Drop for BroadcastDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait::async_trait]
impl Discovery for BroadcastDiscovery {
    async fn advertise(&self, namespace: &str) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::Discovery(format!("Failed to bind broadcast socket: {}", e)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| Error::Discovery(format!("Failed to enable broadcast: {}", e)))?;

        let messages: Vec<String> = self
            .locators
            .iter()
            .map(|l| format_discovery_message(namespace, &l.with_peer(self.local_id)))
            .collect();
        let target = SocketAddr::new(self.target, self.port);

        let token = CancellationToken::new();
        if let Some(previous) = self
            .advertiser
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BROADCAST_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                for message in &messages {
                    if let Err(e) = socket.send_to(message.as_bytes(), target).await {
                        // Broadcast might not be supported on all networks
                        tracing::trace!("Broadcast send failed: {}", e);
                    }
                }
            }
        });

        tracing::debug!("Advertising under {} via UDP broadcast on port {}", namespace, self.port);
        Ok(())
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<Locator>> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| Error::Discovery(format!("Failed to bind discovery socket: {}", e)))?;

        let mut discovered: Vec<Locator> = Vec::new();
        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut buf = [0u8; MAX_DATAGRAM];
        let deadline = tokio::time::Instant::now() + self.scan_window;

        tracing::debug!("Scanning for {} members ({:?})", namespace, self.scan_window);

        loop {
            let (len, src) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    tracing::trace!("Discovery recv error: {}", e);
                    continue;
                }
            };

            let Ok(message) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            let Some((msg_namespace, locator)) = parse_discovery_message(message) else {
                continue;
            };
            if msg_namespace != namespace {
                continue;
            }

            let Some(peer) = locator.peer_id() else {
                continue;
            };
            if peer == self.local_id || !seen.insert(peer) {
                continue;
            }

            let locator = locator.resolve_unspecified(src.ip());
            tracing::info!("Discovered member {} at {} (from {})", peer, locator, src);
            discovered.push(locator);
        }

        Ok(discovered)
    }
}

/// UDP broadcast group channel
#[derive(Debug, Clone)]
pub struct BroadcastPubSub {
    port: u16,
    target: IpAddr,
}

impl BroadcastPubSub {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            target: IpAddr::V4(Ipv4Addr::BROADCAST),
        }
    }

    /// Send to `target` instead of the limited broadcast address
    pub fn with_target(mut self, target: IpAddr) -> Self {
        self.target = target;
        self
    }
}

#[async_trait::async_trait]
impl PubSub for BroadcastPubSub {
    async fn join(&self, topic: &str) -> Result<Box<dyn Topic>> {
        if topic.is_empty() || topic.len() > u8::MAX as usize {
            return Err(Error::Discovery(format!("invalid topic name: {:?}", topic)));
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| Error::Discovery(format!("Failed to bind group socket: {}", e)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| Error::Discovery(format!("Failed to enable broadcast: {}", e)))?;

        tracing::debug!("Joined group {} on UDP port {}", topic, self.port);
        Ok(Box::new(BroadcastTopic {
            socket: Arc::new(socket),
            topic: topic.to_string(),
            target: SocketAddr::new(self.target, self.port),
        }))
    }
}

/// A joined [`BroadcastPubSub`] topic
pub struct BroadcastTopic {
    socket: Arc<UdpSocket>,
    topic: String,
    target: SocketAddr,
}

#[async_trait::async_trait]
impl Topic for BroadcastTopic {
    async fn publish(&self, data: &[u8]) -> Result<()> {
        let datagram = encode_group_datagram(&self.topic, data);
        self.socket
            .send_to(&datagram, self.target)
            .await
            .map_err(|e| Error::Discovery(format!("Group publish failed: {}", e)))?;
        Ok(())
    }

    async fn next(&mut self) -> Option<GroupMessage> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Group channel {} failed: {}", self.topic, e);
                    return None;
                }
            };

            match decode_group_datagram(&buf[..len]) {
                Some((topic, payload)) if topic == self.topic => {
                    return Some(GroupMessage {
                        data: Bytes::copy_from_slice(payload),
                        source: Some(src),
                    });
                }
                _ => continue,
            }
        }
    }
}

/// Format a lookup broadcast message
fn format_discovery_message(namespace: &str, locator: &Locator) -> String {
    format!("{}|{}|{}|{}", DISCOVERY_PREFIX, DISCOVERY_VERSION, namespace, locator)
}

/// Parse a lookup broadcast message into (namespace, locator)
fn parse_discovery_message(message: &str) -> Option<(&str, Locator)> {
    let (prefix, rest) = message.split_once('|')?;
    if prefix != DISCOVERY_PREFIX {
        return None;
    }

    let (version, rest) = rest.split_once('|')?;
    if version.parse::<u8>().ok()? != DISCOVERY_VERSION {
        return None;
    }

    // Locators never contain '|', namespaces might
    let (namespace, locator) = rest.rsplit_once('|')?;
    Some((namespace, locator.parse().ok()?))
}

fn encode_group_datagram(topic: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(GROUP_PREFIX.len() + 1 + topic.len() + payload.len());
    buf.put_slice(GROUP_PREFIX);
    buf.put_u8(topic.len() as u8);
    buf.put_slice(topic.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_group_datagram(datagram: &[u8]) -> Option<(&str, &[u8])> {
    let rest = datagram.strip_prefix(GROUP_PREFIX)?;
    let (&topic_len, rest) = rest.split_first()?;
    let topic_len = topic_len as usize;
    if rest.len() < topic_len {
        return None;
    }

    let topic = std::str::from_utf8(&rest[..topic_len]).ok()?;
    Some((topic, &rest[topic_len..]))
}
