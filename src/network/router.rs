//! Frame Router
//!
//! A single task owns the membership table. Frames read from the local
//! interface and every membership change arrive here as messages; nothing
//! else touches the table.
//!
//! Members are keyed by overlay identity. Hardware addresses live in a
//! secondary index, filled in once a handshake or an announcement supplies
//! them, and unicast routing goes through that index.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::member::{self, Enqueue, Link, Member, MemberStatus};
use super::{NetworkOptions, PROTOCOL};
use crate::error::{Error, Result};
use crate::ethernet::{self, HardwareAddr};
use crate::overlay::{BoxStream, Locator, Overlay, PeerId};

/// Where a membership candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateSource {
    /// An overlay connection to the peer came up
    Connection,
    /// The peer announced itself on the group channel
    Announcement,
}

#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) peer: PeerId,
    pub(crate) hardware_address: Option<HardwareAddr>,
    pub(crate) locator: Option<Locator>,
    pub(crate) source: CandidateSource,
}

impl Candidate {
    pub(crate) fn connected(peer: PeerId) -> Self {
        Self {
            peer,
            hardware_address: None,
            locator: None,
            source: CandidateSource::Connection,
        }
    }

    pub(crate) fn announced(peer: PeerId, hardware_address: HardwareAddr, locator: Locator) -> Self {
        Self {
            peer,
            hardware_address: Some(hardware_address),
            locator: Some(locator),
            source: CandidateSource::Announcement,
        }
    }
}

/// A handshaken stream ready to be bound to a member
pub(crate) struct ReadyStream {
    pub(crate) peer: PeerId,
    pub(crate) hardware_address: HardwareAddr,
    /// Which side opened the stream
    pub(crate) initiator: PeerId,
    pub(crate) stream: BoxStream,
}

/// Requests to the router task
pub(crate) enum Control {
    Candidate(Candidate),
    StreamReady(ReadyStream),
    ConnectFailed { peer: PeerId, attempt: u64, error: Error },
    DeliveryFailed { peer: PeerId, generation: u64 },
    ReceiveFailed { peer: PeerId, generation: u64 },
    StreamClosed { peer: PeerId, generation: u64 },
    Snapshot(oneshot::Sender<Vec<MemberStatus>>),
}

pub(crate) struct Router {
    local_id: PeerId,
    hardware_address: HardwareAddr,
    overlay: Arc<dyn Overlay>,
    options: NetworkOptions,
    members: HashMap<PeerId, Member>,
    by_address: HashMap<HardwareAddr, PeerId>,
    control: mpsc::Sender<Control>,
    ingoing: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    next_generation: u64,
}

impl Router {
    pub(crate) fn new(
        overlay: Arc<dyn Overlay>,
        hardware_address: HardwareAddr,
        options: NetworkOptions,
        control: mpsc::Sender<Control>,
        ingoing: mpsc::Sender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            local_id: overlay.local_id(),
            hardware_address,
            overlay,
            options,
            members: HashMap::new(),
            by_address: HashMap::new(),
            control,
            ingoing,
            shutdown,
            next_generation: 0,
        }
    }

    /// Run until shutdown, then close every member
    pub(crate) async fn run(mut self, mut requests: mpsc::Receiver<Control>, mut outgoing: mpsc::Receiver<Bytes>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(request) = requests.recv() => self.handle(request),
                frame = outgoing.recv() => match frame {
                    Some(frame) => self.route(frame),
                    None => break,
                },
            }
        }

        tracing::debug!("Router stopping, closing {} members", self.members.len());
        self.members.clear();
        self.by_address.clear();
    }

    fn handle(&mut self, request: Control) {
        match request {
            Control::Candidate(candidate) => self.admit(candidate),
            Control::StreamReady(ready) => self.attach(ready),
            Control::ConnectFailed { peer, attempt, error } => {
                let current = self
                    .members
                    .get(&peer)
                    .is_some_and(|m| matches!(m.link, Link::Connecting { attempt: a, .. } if a == attempt));
                if current {
                    if error.is_per_peer() {
                        tracing::warn!("Dropping member {}: {}", peer, error);
                    } else {
                        tracing::error!("Dropping member {} after unexpected error: {}", peer, error);
                    }
                    self.remove(peer);
                } else {
                    tracing::debug!("Stale connect attempt to {} failed: {}", peer, error);
                }
            }
            Control::DeliveryFailed { peer, generation } => {
                if self.is_current(peer, generation) {
                    tracing::info!("Removing member {} after write failure", peer);
                    self.remove(peer);
                }
            }
            Control::ReceiveFailed { peer, generation } => {
                if self.is_current(peer, generation) {
                    tracing::info!("Removing member {} after read failure", peer);
                    self.remove(peer);
                }
            }
            Control::StreamClosed { peer, generation } => {
                if self.is_current(peer, generation) {
                    if let Some(member) = self.members.get_mut(&peer) {
                        member.detach();
                    }
                }
            }
            Control::Snapshot(reply) => {
                let _ = reply.send(self.members.values().map(Member::status).collect());
            }
        }
    }

    fn is_current(&self, peer: PeerId, generation: u64) -> bool {
        self.members
            .get(&peer)
            .is_some_and(|m| matches!(m.link, Link::Connected { generation: g, .. } if g == generation))
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Outbound frame from the local interface
    fn route(&mut self, frame: Bytes) {
        let Some(destination) = ethernet::destination(&frame) else {
            tracing::trace!("Dropping runt frame ({} bytes)", frame.len());
            return;
        };

        if destination.is_broadcast() {
            let peers: Vec<PeerId> = self.members.keys().copied().collect();
            for peer in peers {
                self.deliver_to(peer, frame.clone());
            }
            return;
        }

        match self.by_address.get(&destination).copied() {
            Some(peer) => self.deliver_to(peer, frame),
            None => tracing::trace!(
                "No member for {}, dropping frame from {:?}",
                destination,
                ethernet::source(&frame)
            ),
        }
    }

    fn deliver_to(&mut self, peer: PeerId, frame: Bytes) {
        let Some(member) = self.members.get(&peer) else {
            return;
        };
        if member.is_idle() {
            self.connect(peer);
        }

        let capacity = self.options.queue_capacity;
        let Some(member) = self.members.get_mut(&peer) else {
            return;
        };
        match member.enqueue(frame, capacity) {
            Enqueue::Queued => {}
            Enqueue::Full => tracing::trace!("Queue to {} full, dropping frame", peer),
            Enqueue::Closing => tracing::trace!("Link to {} closing, dropping frame", peer),
            Enqueue::Broken => {
                tracing::info!("Removing member {} with a closed queue", peer);
                self.remove(peer);
            }
        }
    }

    /// Membership candidate from discovery or the notifier
    fn admit(&mut self, candidate: Candidate) {
        let peer = candidate.peer;
        if peer == self.local_id {
            return;
        }
        if let Some(address) = candidate.hardware_address {
            if address == self.hardware_address || address.is_broadcast() {
                tracing::warn!("Ignoring candidate {} claiming address {}", peer, address);
                return;
            }
        }

        let member = self.members.entry(peer).or_insert_with(|| {
            tracing::info!("New member {}", peer);
            Member::new(peer)
        });
        if candidate.locator.is_some() {
            member.locator = candidate.locator;
        }
        if let Some(address) = candidate.hardware_address {
            self.learn_address(peer, address);
        }

        // Connect early so both sides learn each other's address; only the
        // lower identity does it to avoid crossing streams.
        let idle = self.members.get(&peer).is_some_and(Member::is_idle);
        if candidate.source == CandidateSource::Connection && idle && self.local_id < peer {
            self.connect(peer);
        }
    }

    /// Bind `address` to `peer`, evicting any other member holding it
    fn learn_address(&mut self, peer: PeerId, address: HardwareAddr) {
        if let Some(owner) = self.by_address.get(&address).copied() {
            if owner != peer {
                tracing::warn!("Address {} moved from {} to {}", address, owner, peer);
                self.remove(owner);
            }
        }

        let Some(member) = self.members.get_mut(&peer) else {
            return;
        };
        if let Some(previous) = member.hardware_address.replace(address) {
            if previous != address && self.by_address.get(&previous) == Some(&peer) {
                self.by_address.remove(&previous);
            }
        }
        self.by_address.insert(address, peer);
    }

    fn remove(&mut self, peer: PeerId) {
        if let Some(member) = self.members.remove(&peer) {
            if let Some(address) = member.hardware_address {
                if self.by_address.get(&address) == Some(&peer) {
                    self.by_address.remove(&address);
                }
            }
        }
    }

    /// Start opening a stream to an idle member
    fn connect(&mut self, peer: PeerId) {
        let attempt = self.next_generation();
        let Some(member) = self.members.get_mut(&peer) else {
            return;
        };
        member.link = Link::Connecting {
            attempt,
            pending: VecDeque::new(),
        };

        let task = Connector {
            overlay: Arc::clone(&self.overlay),
            peer,
            locator: member.locator.clone(),
            local_address: self.hardware_address,
            options: self.options.clone(),
        };
        let control = self.control.clone();
        let shutdown = self.shutdown.clone();

        tracing::debug!("Connecting to member {}", peer);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = task.establish() => result,
            };

            let request = match result {
                Ok((stream, hardware_address)) => Control::StreamReady(ReadyStream {
                    peer,
                    hardware_address,
                    initiator: task.overlay.local_id(),
                    stream,
                }),
                Err(error) => Control::ConnectFailed { peer, attempt, error },
            };
            let _ = control.send(request).await;
        });
    }

    /// Bind a handshaken stream to its member.
    ///
    /// At most one stream per peer pair survives: when one is already
    /// attached, the stream opened by the lower identity wins on both sides.
    fn attach(&mut self, ready: ReadyStream) {
        let ReadyStream {
            peer,
            hardware_address,
            initiator,
            stream,
        } = ready;
        if peer == self.local_id {
            return;
        }

        self.members.entry(peer).or_insert_with(|| {
            tracing::info!("New member {}", peer);
            Member::new(peer)
        });
        self.learn_address(peer, hardware_address);

        let Some(member) = self.members.get_mut(&peer) else {
            return;
        };
        if let Link::Connected { initiator: existing, .. } = member.link {
            if existing < initiator {
                tracing::debug!("Keeping stream to {} opened by {}", peer, existing);
                return;
            }
        }

        let pending = member.detach();
        let generation = self.next_generation();
        let reset = self.shutdown.child_token();
        let (queue_tx, queue_rx) = mpsc::channel(self.options.queue_capacity);
        for frame in pending {
            let _ = queue_tx.try_send(frame);
        }

        let (source, sink) = member::framed(stream);
        tokio::spawn(member::deliver(
            peer,
            generation,
            queue_rx,
            sink,
            reset.clone(),
            self.control.clone(),
        ));
        tokio::spawn(member::receive(
            peer,
            generation,
            source,
            self.ingoing.clone(),
            reset.clone(),
            self.control.clone(),
        ));

        tracing::info!("Member {} ({}) connected", peer, hardware_address);
        if let Some(member) = self.members.get_mut(&peer) {
            member.link = Link::Connected {
                generation,
                initiator,
                queue: queue_tx,
                reset,
            };
        }
    }
}

/// Everything a connect attempt needs, detached from the router
struct Connector {
    overlay: Arc<dyn Overlay>,
    peer: PeerId,
    locator: Option<Locator>,
    local_address: HardwareAddr,
    options: NetworkOptions,
}

impl Connector {
    /// Open and handshake a stream, falling back to a locator dial
    async fn establish(&self) -> Result<(BoxStream, HardwareAddr)> {
        let stream = match self.open().await {
            Ok(stream) => stream,
            Err(first) => {
                let Some(ref locator) = self.locator else {
                    return Err(first);
                };
                tracing::debug!("Stream to {} failed ({}), dialling {}", self.peer, first, locator);

                match timeout(self.options.connect_timeout, self.overlay.connect(locator)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(Error::ConnectionTimeout(locator.to_string())),
                };
                self.open().await?
            }
        };

        match timeout(
            self.options.handshake_timeout,
            member::handshake_initiator(stream, self.peer, self.local_address),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Handshake {
                peer: self.peer,
                reason: "timed out".into(),
            }),
        }
    }

    async fn open(&self) -> Result<BoxStream> {
        match timeout(self.options.connect_timeout, self.overlay.open_stream(self.peer, PROTOCOL)).await {
            Ok(result) => result,
            Err(_) => Err(Error::StreamOpen {
                peer: self.peer,
                reason: "timed out".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use super::*;
    use crate::overlay::MemoryHub;

    /// Stream whose writes always fail and whose reads never complete
    struct BrokenStream;

    impl AsyncRead for BrokenStream {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Stream whose reads fail as if the remote reset it
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Harness {
        control: mpsc::Sender<Control>,
        outgoing: mpsc::Sender<Bytes>,
        shutdown: CancellationToken,
        local_id: PeerId,
        local: HardwareAddr,
    }

    impl Harness {
        fn start() -> Self {
            let hub = MemoryHub::new();
            let overlay: Arc<dyn Overlay> = Arc::new(hub.node());
            let local_id = overlay.local_id();
            let local: HardwareAddr = "aa:aa:aa:aa:aa:01".parse().unwrap();
            let (control_tx, control_rx) = mpsc::channel(64);
            let (outgoing_tx, outgoing_rx) = mpsc::channel(32);
            let (ingoing_tx, _ingoing_rx) = mpsc::channel(32);
            let shutdown = CancellationToken::new();

            let router = Router::new(
                overlay,
                local,
                NetworkOptions::default(),
                control_tx.clone(),
                ingoing_tx,
                shutdown.clone(),
            );
            tokio::spawn(router.run(control_rx, outgoing_rx));

            Self {
                control: control_tx,
                outgoing: outgoing_tx,
                shutdown,
                local_id,
                local,
            }
        }

        async fn members(&self) -> Vec<MemberStatus> {
            let (tx, rx) = oneshot::channel();
            self.control.send(Control::Snapshot(tx)).await.unwrap();
            rx.await.unwrap()
        }

        async fn attach(&self, peer: PeerId, address: HardwareAddr, initiator: PeerId, stream: BoxStream) {
            let ready = ReadyStream {
                peer,
                hardware_address: address,
                initiator,
                stream,
            };
            self.control.send(Control::StreamReady(ready)).await.unwrap();
        }

        /// Attach a working stream, returning the remote end
        async fn attach_pipe(&self, peer: PeerId, address: HardwareAddr) -> member::FrameSource {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            self.attach(peer, address, peer, Box::new(local)).await;
            let (source, _) = member::framed(Box::new(remote));
            source
        }

        fn frame_to(&self, destination: HardwareAddr, payload: &[u8]) -> Bytes {
            Bytes::from(ethernet::build_frame(destination, self.local, 0x0800, payload))
        }
    }

    async fn wait_for_members(harness: &Harness, count: usize) -> Vec<MemberStatus> {
        for _ in 0..200 {
            let members = harness.members().await;
            if members.len() == count {
                return members;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("membership never reached {} members", count);
    }

    #[tokio::test]
    async fn test_candidates_dedup_and_index() {
        let harness = Harness::start();
        let peer = PeerId::random();
        let address: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let locator: Locator = "10.0.0.2:9600".parse().unwrap();

        harness
            .control
            .send(Control::Candidate(Candidate::announced(peer, address, locator.with_peer(peer))))
            .await
            .unwrap();
        harness
            .control
            .send(Control::Candidate(Candidate::announced(peer, address, locator.with_peer(peer))))
            .await
            .unwrap();
        // Ourselves and our own address are never members
        harness
            .control
            .send(Control::Candidate(Candidate::connected(harness.local_id)))
            .await
            .unwrap();
        harness
            .control
            .send(Control::Candidate(Candidate::announced(PeerId::random(), harness.local, locator)))
            .await
            .unwrap();

        let members = harness.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].peer, peer);
        assert_eq!(members[0].hardware_address, Some(address));
        assert_eq!(members[0].link, member::LinkState::Idle);
    }

    #[tokio::test]
    async fn test_address_claimed_by_new_peer_evicts_old() {
        let harness = Harness::start();
        let address: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let locator: Locator = "10.0.0.2:9600".parse().unwrap();
        let old = PeerId::random();
        let new = PeerId::random();

        for peer in [old, new] {
            harness
                .control
                .send(Control::Candidate(Candidate::announced(peer, address, locator.with_peer(peer))))
                .await
                .unwrap();
        }

        let members = harness.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].peer, new);
    }

    #[tokio::test]
    async fn test_unicast_and_broadcast_routing() {
        let harness = Harness::start();
        let b_id = PeerId::random();
        let c_id = PeerId::random();
        let b: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let c: HardwareAddr = "cc:cc:cc:cc:cc:03".parse().unwrap();
        let mut b_remote = harness.attach_pipe(b_id, b).await;
        let mut c_remote = harness.attach_pipe(c_id, c).await;
        wait_for_members(&harness, 2).await;

        let to_b = harness.frame_to(b, b"for b");
        harness.outgoing.send(to_b.clone()).await.unwrap();
        assert_eq!(b_remote.next().await.unwrap().unwrap().freeze(), to_b);

        let everyone = harness.frame_to(HardwareAddr::BROADCAST, b"for all");
        harness.outgoing.send(everyone.clone()).await.unwrap();
        assert_eq!(b_remote.next().await.unwrap().unwrap().freeze(), everyone);
        assert_eq!(c_remote.next().await.unwrap().unwrap().freeze(), everyone);
    }

    #[tokio::test]
    async fn test_write_failure_removes_only_that_member() {
        let harness = Harness::start();
        let b_id = PeerId::random();
        let c_id = PeerId::random();
        let b: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let c: HardwareAddr = "cc:cc:cc:cc:cc:03".parse().unwrap();

        harness.attach(b_id, b, b_id, Box::new(BrokenStream)).await;
        let mut c_remote = harness.attach_pipe(c_id, c).await;
        wait_for_members(&harness, 2).await;

        harness.outgoing.send(harness.frame_to(b, b"lost")).await.unwrap();
        let members = wait_for_members(&harness, 1).await;
        assert_eq!(members[0].peer, c_id);

        let to_c = harness.frame_to(c, b"still here");
        harness.outgoing.send(to_c.clone()).await.unwrap();
        assert_eq!(c_remote.next().await.unwrap().unwrap().freeze(), to_c);
    }

    #[tokio::test]
    async fn test_read_failure_removes_only_that_member() {
        let harness = Harness::start();
        let b_id = PeerId::random();
        let c_id = PeerId::random();
        let b: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let c: HardwareAddr = "cc:cc:cc:cc:cc:03".parse().unwrap();

        let mut c_remote = harness.attach_pipe(c_id, c).await;
        harness.attach(b_id, b, b_id, Box::new(ResetStream)).await;

        let members = wait_for_members(&harness, 1).await;
        assert_eq!(members[0].peer, c_id);

        // B's address is no longer routable; C is untouched
        harness.outgoing.send(harness.frame_to(b, b"gone")).await.unwrap();
        let to_c = harness.frame_to(c, b"still here");
        harness.outgoing.send(to_c.clone()).await.unwrap();
        assert_eq!(c_remote.next().await.unwrap().unwrap().freeze(), to_c);
        assert_eq!(harness.members().await.len(), 1);
    }

    #[tokio::test]
    async fn test_clean_close_keeps_member_idle() {
        let harness = Harness::start();
        let peer = PeerId::random();
        let address: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let (local, remote) = tokio::io::duplex(4096);
        harness.attach(peer, address, peer, Box::new(local)).await;
        wait_for_members(&harness, 1).await;

        drop(remote);
        for _ in 0..200 {
            let members = harness.members().await;
            assert_eq!(members.len(), 1);
            if members[0].link == member::LinkState::Idle {
                assert_eq!(members[0].hardware_address, Some(address));
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("member never went idle");
    }

    #[tokio::test]
    async fn test_connected_then_announced_merges() {
        let harness = Harness::start();
        // Lowest identity, so the connection candidate does not dial out
        let peer = PeerId::from_bytes([0u8; 16]);
        let address: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let locator: Locator = "10.0.0.2:9600".parse().unwrap();

        harness
            .control
            .send(Control::Candidate(Candidate::connected(peer)))
            .await
            .unwrap();
        harness
            .control
            .send(Control::Candidate(Candidate::announced(peer, address, locator.with_peer(peer))))
            .await
            .unwrap();

        let members = harness.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].peer, peer);
        assert_eq!(members[0].hardware_address, Some(address));
        assert_eq!(members[0].link, member::LinkState::Idle);

        // A second identity claiming the address replaces the merged member,
        // which only happens if the address was indexed
        let other = PeerId::from_bytes([1u8; 16]);
        harness
            .control
            .send(Control::Candidate(Candidate::announced(other, address, locator.with_peer(other))))
            .await
            .unwrap();
        let members = harness.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].peer, other);
    }

    #[tokio::test]
    async fn test_tie_break_keeps_lower_initiator() {
        let harness = Harness::start();
        let peer = PeerId::random();
        let address: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let low = PeerId::from_bytes([0u8; 16]);
        let high = PeerId::from_bytes([0xffu8; 16]);

        let (kept_local, kept_remote) = tokio::io::duplex(4096);
        harness.attach(peer, address, low, Box::new(kept_local)).await;
        let (rejected_local, rejected_remote) = tokio::io::duplex(4096);
        harness.attach(peer, address, high, Box::new(rejected_local)).await;
        wait_for_members(&harness, 1).await;

        let frame = harness.frame_to(address, b"which stream");
        harness.outgoing.send(frame.clone()).await.unwrap();

        let (mut kept, _) = member::framed(Box::new(kept_remote));
        assert_eq!(kept.next().await.unwrap().unwrap().freeze(), frame);

        // The rejected stream was dropped without carrying anything
        let (mut rejected, _) = member::framed(Box::new(rejected_remote));
        assert!(rejected.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_destination_dropped() {
        let harness = Harness::start();
        let b_id = PeerId::random();
        let b: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();
        let (local, remote) = tokio::io::duplex(4096);
        harness.attach(b_id, b, b_id, Box::new(local)).await;
        wait_for_members(&harness, 1).await;

        let stranger: HardwareAddr = "dd:dd:dd:dd:dd:04".parse().unwrap();
        harness.outgoing.send(harness.frame_to(stranger, b"nobody")).await.unwrap();
        harness.outgoing.send(Bytes::from_static(b"runt")).await.unwrap();
        harness.outgoing.send(harness.frame_to(b, b"marker")).await.unwrap();

        // Only the marker reaches B
        let (mut source, _) = member::framed(Box::new(remote));
        let first = source.next().await.unwrap().unwrap();
        assert_eq!(&first[ethernet::HEADER_LEN..], b"marker");
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_ingoing_queue() {
        let hub = MemoryHub::new();
        let overlay: Arc<dyn Overlay> = Arc::new(hub.node());
        let (control_tx, control_rx) = mpsc::channel(64);
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(32);
        let (ingoing_tx, mut ingoing_rx) = mpsc::channel(32);
        let router = Router::new(
            overlay,
            HardwareAddr::random_local(),
            NetworkOptions::default(),
            control_tx.clone(),
            ingoing_tx,
            CancellationToken::new(),
        );
        tokio::spawn(router.run(control_rx, outgoing_rx));

        let peer = PeerId::random();
        let (local, remote) = tokio::io::duplex(4096);
        control_tx
            .send(Control::StreamReady(ReadyStream {
                peer,
                hardware_address: "bb:bb:bb:bb:bb:02".parse().unwrap(),
                initiator: peer,
                stream: Box::new(local),
            }))
            .await
            .unwrap();

        let (_, mut sink) = member::framed(Box::new(remote));
        sink.send(Bytes::from_static(b"inbound frame")).await.unwrap();
        assert_eq!(&ingoing_rx.recv().await.unwrap()[..], b"inbound frame");
    }
}
