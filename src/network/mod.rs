//! Network Module
//!
//! One virtual Ethernet segment on top of an overlay. [`VirtualNetwork`]
//! wires the local interface to the frame router and starts the tasks that
//! feed it:
//!
//! - outbound pump: interface reads onto the shared outgoing queue
//! - inbound pump: shared ingoing queue onto interface writes
//! - stream acceptor: handshakes inbound `/tap` streams
//! - notifier: overlay connections become membership candidates
//! - announcer: group channel announcements (optional)
//!
//! A lookup bootstrap runs once after everything else is up.

mod announcer;
mod member;
mod notifier;
mod router;

pub use member::{LinkState, MemberStatus};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use self::announcer::Announcer;
use self::router::{Control, ReadyStream, Router};
use crate::discovery::{Discovery, PubSub};
use crate::error::{Error, Result};
use crate::ethernet::{HardwareAddr, MAX_FRAME_LEN};
use crate::interface::VirtualInterface;
use crate::overlay::{InboundStream, Overlay, PeerId};
use crate::peer_info::PeerInfo;

/// Protocol tag of the frame transport
pub const PROTOCOL: &str = "/tap";

/// Capacity of every frame queue
pub const QUEUE_CAPACITY: usize = 32;

/// Capacity of the router's request queue
const CONTROL_CAPACITY: usize = 64;

/// Router and bootstrap tuning
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Frames buffered per member and per shared queue
    pub queue_capacity: usize,
    /// Bound on each overlay connect or stream open
    pub connect_timeout: Duration,
    /// Bound on the whole lookup bootstrap
    pub bootstrap_timeout: Duration,
    /// Bound on the address exchange of a new stream
    pub handshake_timeout: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: QUEUE_CAPACITY,
            connect_timeout: Duration::from_secs(15),
            bootstrap_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Discovery collaborators; either, both or neither may be present
#[derive(Clone, Default)]
pub struct Discoverers {
    pub lookup: Option<Arc<dyn Discovery>>,
    pub group: Option<Arc<dyn PubSub>>,
}

impl Discoverers {
    pub fn lookup(lookup: Arc<dyn Discovery>) -> Self {
        Self {
            lookup: Some(lookup),
            group: None,
        }
    }

    pub fn group(group: Arc<dyn PubSub>) -> Self {
        Self {
            lookup: None,
            group: Some(group),
        }
    }
}

/// A running virtual network instance
pub struct VirtualNetwork {
    name: String,
    local_id: PeerId,
    hardware_address: HardwareAddr,
    overlay: Arc<dyn Overlay>,
    interface: Arc<dyn VirtualInterface>,
    control: mpsc::Sender<Control>,
    shutdown: CancellationToken,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl VirtualNetwork {
    /// Join network `name`.
    ///
    /// Cancelling `parent` shuts the instance down. Discovery failures are
    /// logged and never fail the call.
    pub async fn create(
        parent: &CancellationToken,
        name: &str,
        overlay: Arc<dyn Overlay>,
        interface: Arc<dyn VirtualInterface>,
        discoverers: Discoverers,
        options: NetworkOptions,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::Config("network name cannot be empty".into()));
        }

        let local_id = overlay.local_id();
        let hardware_address = interface.hardware_address();
        let inbound = overlay.accept_streams(PROTOCOL)?;
        let events = overlay.subscribe();
        let shutdown = parent.child_token();

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(options.queue_capacity);
        let (ingoing_tx, ingoing_rx) = mpsc::channel(options.queue_capacity);

        let router = Router::new(
            Arc::clone(&overlay),
            hardware_address,
            options.clone(),
            control_tx.clone(),
            ingoing_tx,
            shutdown.clone(),
        );

        let mut tasks = vec![
            tokio::spawn(router.run(control_rx, outgoing_rx)),
            tokio::spawn(pump_outbound(Arc::clone(&interface), outgoing_tx, shutdown.clone())),
            tokio::spawn(pump_inbound(Arc::clone(&interface), ingoing_rx, shutdown.clone())),
            tokio::spawn(accept_streams(
                inbound,
                hardware_address,
                options.handshake_timeout,
                control_tx.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(notifier::run(events, control_tx.clone(), shutdown.clone())),
        ];

        if let Some(ref group) = discoverers.group {
            match start_announcer(group.as_ref(), name, overlay.as_ref(), hardware_address).await {
                Ok(announcer) => {
                    tasks.push(tokio::spawn(announcer.run(control_tx.clone(), shutdown.clone())));
                }
                Err(e) => tracing::warn!("Group announcements disabled: {}", e),
            }
        }

        tracing::info!(
            "Joined network {} as {} ({} on {})",
            name,
            local_id,
            hardware_address,
            interface.name()
        );

        if let Some(ref lookup) = discoverers.lookup {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = bootstrap(overlay.as_ref(), lookup.as_ref(), name, &options) => {}
            }
        }

        Ok(Self {
            name: name.to_string(),
            local_id,
            hardware_address,
            overlay,
            interface,
            control: control_tx,
            shutdown,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn hardware_address(&self) -> HardwareAddr {
        self.hardware_address
    }

    /// Snapshot of the membership table
    pub async fn members(&self) -> Result<Vec<MemberStatus>> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot(tx))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Resolves once the instance has shut down, whatever the cause
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop every task, unregister the frame protocol and close the
    /// interface. Later calls return immediately.
    pub async fn close(&self) -> Result<()> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };

        tracing::info!("Leaving network {}", self.name);
        self.shutdown.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Network task ended abnormally: {}", e);
            }
        }

        self.overlay.remove_stream_handler(PROTOCOL);
        self.interface.close().await
    }
}

async fn start_announcer(
    group: &dyn PubSub,
    name: &str,
    overlay: &dyn Overlay,
    hardware_address: HardwareAddr,
) -> Result<Announcer> {
    let locator = overlay
        .listen_locators()
        .into_iter()
        .next()
        .ok_or_else(|| Error::Discovery("overlay has no listen locator".into()))?;
    let own = PeerInfo::new(hardware_address, locator.with_peer(overlay.local_id()));
    let topic = group.join(name).await?;

    Ok(Announcer::new(topic, overlay.local_id(), &own))
}

/// Advertise, look up and connect to every peer found, all bounded.
/// Failures are logged; the caller carries on regardless.
async fn bootstrap(overlay: &dyn Overlay, lookup: &dyn Discovery, name: &str, options: &NetworkOptions) {
    let local_id = overlay.local_id();

    let run = async {
        lookup.advertise(name).await?;
        let peers = lookup.find_peers(name).await?;

        let attempts = peers
            .into_iter()
            .filter(|locator| locator.peer_id() != Some(local_id))
            .map(|locator| async move {
                match timeout(options.connect_timeout, overlay.connect(&locator)).await {
                    Ok(Ok(peer)) => {
                        tracing::debug!("Bootstrap connected to {} at {}", peer, locator);
                        true
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Bootstrap connection to {} failed: {}", locator, e);
                        false
                    }
                    Err(_) => {
                        tracing::warn!("{}", Error::ConnectionTimeout(locator.to_string()));
                        false
                    }
                }
            });

        let results = futures::future::join_all(attempts).await;
        Ok::<_, Error>((results.iter().filter(|ok| **ok).count(), results.len()))
    };

    match timeout(options.bootstrap_timeout, run).await {
        Ok(Ok((connected, found))) => {
            tracing::info!("Bootstrap of {} done: connected to {} of {} peers", name, connected, found)
        }
        Ok(Err(e)) => tracing::warn!("Bootstrap of {} failed: {}", name, e),
        Err(_) => tracing::warn!("Bootstrap of {} timed out", name),
    }
}

/// Local interface reads onto the outgoing queue
async fn pump_outbound(
    interface: Arc<dyn VirtualInterface>,
    outgoing: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = interface.read_frame(&mut buf) => read,
        };

        match read {
            Ok(0) => continue,
            Ok(len) => {
                let frame = Bytes::copy_from_slice(&buf[..len]);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = outgoing.send(frame) => if sent.is_err() { return },
                }
            }
            Err(e) if e.is_fatal() => {
                tracing::error!("Reading from {} failed, shutting down: {}", interface.name(), e);
                shutdown.cancel();
                return;
            }
            Err(e) => tracing::warn!("Dropping unreadable frame on {}: {}", interface.name(), e),
        }
    }
}

/// Ingoing queue onto local interface writes
async fn pump_inbound(
    interface: Arc<dyn VirtualInterface>,
    mut ingoing: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = ingoing.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        match interface.write_frame(&frame).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!("Writing to {} failed, shutting down: {}", interface.name(), e);
                shutdown.cancel();
                return;
            }
            Err(e) => tracing::warn!("Dropping frame for {}: {}", interface.name(), e),
        }
    }
}

/// Handshake inbound frame streams and hand them to the router
async fn accept_streams(
    mut inbound: mpsc::Receiver<InboundStream>,
    local: HardwareAddr,
    handshake_timeout: Duration,
    control: mpsc::Sender<Control>,
    shutdown: CancellationToken,
) {
    loop {
        let InboundStream { peer, stream } = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = inbound.recv() => match accepted {
                Some(accepted) => accepted,
                None => return,
            },
        };

        let control = control.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let handshake = timeout(handshake_timeout, member::handshake_responder(stream, peer, local));
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = handshake => result,
            };

            match result {
                Ok(Ok((stream, hardware_address))) => {
                    let ready = ReadyStream {
                        peer,
                        hardware_address,
                        initiator: peer,
                        stream,
                    };
                    let _ = control.send(Control::StreamReady(ready)).await;
                }
                Ok(Err(e)) => tracing::debug!("Rejected stream from {}: {}", peer, e),
                Err(_) => tracing::debug!("Handshake with {} timed out", peer),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::interface::MemoryInterface;
    use crate::overlay::{Locator, MemoryHub};

    #[test]
    fn test_default_options() {
        let options = NetworkOptions::default();
        assert_eq!(options.queue_capacity, 32);
        assert_eq!(options.connect_timeout, Duration::from_secs(15));
        assert_eq!(options.bootstrap_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_create_rejects_empty_name() {
        let hub = MemoryHub::new();
        let (interface, _handle) = MemoryInterface::new("mem0", HardwareAddr::random_local());
        let result = VirtualNetwork::create(
            &CancellationToken::new(),
            "",
            Arc::new(hub.node()),
            Arc::new(interface),
            Discoverers::default(),
            NetworkOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_protocol() {
        let hub = MemoryHub::new();
        let overlay = Arc::new(hub.node());
        let (interface, _handle) = MemoryInterface::new("mem0", HardwareAddr::random_local());

        let network = VirtualNetwork::create(
            &CancellationToken::new(),
            "demo",
            overlay.clone(),
            Arc::new(interface),
            Discoverers::default(),
            NetworkOptions::default(),
        )
        .await
        .unwrap();
        assert!(network.members().await.unwrap().is_empty());

        network.close().await.unwrap();
        network.close().await.unwrap();
        assert!(network.is_closed());
        assert!(matches!(network.members().await, Err(Error::ShuttingDown)));

        // The protocol can be claimed again
        assert!(overlay.accept_streams(PROTOCOL).is_ok());
    }

    #[tokio::test]
    async fn test_parent_cancellation_closes_network() {
        let hub = MemoryHub::new();
        let parent = CancellationToken::new();
        let (interface, _handle) = MemoryInterface::new("mem0", HardwareAddr::random_local());
        let network = VirtualNetwork::create(
            &parent,
            "demo",
            Arc::new(hub.node()),
            Arc::new(interface),
            Discoverers::default(),
            NetworkOptions::default(),
        )
        .await
        .unwrap();

        parent.cancel();
        network.closed().await;
        network.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interface_failure_is_fatal() {
        let hub = MemoryHub::new();
        let (interface, handle) = MemoryInterface::new("mem0", HardwareAddr::random_local());
        let network = VirtualNetwork::create(
            &CancellationToken::new(),
            "demo",
            Arc::new(hub.node()),
            Arc::new(interface),
            Discoverers::default(),
            NetworkOptions::default(),
        )
        .await
        .unwrap();

        // Host side disappears: the next read fails
        drop(handle);
        network.closed().await;
        network.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_survives_bad_peers() {
        let hub = MemoryHub::new();
        let overlay = Arc::new(hub.node());
        let ghost = Locator::new(vec![crate::overlay::Protocol::Peer(PeerId::random())]);
        let own = overlay.listen_locators()[0].clone();
        let lookup = StaticDiscovery::new(vec![ghost, own]);
        let (interface, _handle) = MemoryInterface::new("mem0", HardwareAddr::random_local());

        let network = VirtualNetwork::create(
            &CancellationToken::new(),
            "demo",
            overlay,
            Arc::new(interface),
            Discoverers::lookup(Arc::new(lookup)),
            NetworkOptions::default(),
        )
        .await
        .unwrap();

        assert!(network.members().await.unwrap().is_empty());
        network.close().await.unwrap();
    }
}
