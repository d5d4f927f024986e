//! Member state and the frame transport
//!
//! A [`Member`] is this node's view of one remote participant. Once a stream
//! is attached, a delivery task drains the member's queue onto the stream and
//! a receive task forwards whatever the remote sends onto the shared ingoing
//! queue. Frames travel length-prefixed after a raw 6-byte address handshake.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::router::Control;
use crate::error::{Error, Result};
use crate::ethernet::{HardwareAddr, MAC_SIZE, MAX_FRAME_LEN};
use crate::overlay::{BoxStream, Locator, PeerId};

pub(crate) type FrameSink = FramedWrite<WriteHalf<BoxStream>, LengthDelimitedCodec>;
pub(crate) type FrameSource = FramedRead<ReadHalf<BoxStream>, LengthDelimitedCodec>;

/// Link state reported in membership snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Known, no stream
    Idle,
    /// Stream being opened
    Connecting,
    /// Stream attached
    Connected,
}

/// Read-only view of one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub peer: PeerId,
    pub hardware_address: Option<HardwareAddr>,
    pub link: LinkState,
}

pub(crate) enum Link {
    Idle,
    Connecting {
        attempt: u64,
        pending: VecDeque<Bytes>,
    },
    Connected {
        generation: u64,
        initiator: PeerId,
        queue: mpsc::Sender<Bytes>,
        reset: CancellationToken,
    },
}

/// Result of handing a frame to a member
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    /// Queue full, frame dropped
    Full,
    /// Link is being torn down, frame dropped
    Closing,
    /// Outbound path is gone for good
    Broken,
}

pub(crate) struct Member {
    pub(crate) peer: PeerId,
    pub(crate) hardware_address: Option<HardwareAddr>,
    pub(crate) locator: Option<Locator>,
    pub(crate) link: Link,
}

impl Member {
    pub(crate) fn new(peer: PeerId) -> Self {
        Self {
            peer,
            hardware_address: None,
            locator: None,
            link: Link::Idle,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.link, Link::Idle)
    }

    pub(crate) fn status(&self) -> MemberStatus {
        let link = match self.link {
            Link::Idle => LinkState::Idle,
            Link::Connecting { .. } => LinkState::Connecting,
            Link::Connected { .. } => LinkState::Connected,
        };
        MemberStatus {
            peer: self.peer,
            hardware_address: self.hardware_address,
            link,
        }
    }

    /// Queue a frame without blocking. Idle members have nowhere to put it.
    pub(crate) fn enqueue(&mut self, frame: Bytes, capacity: usize) -> Enqueue {
        match &mut self.link {
            Link::Idle => Enqueue::Broken,
            Link::Connecting { pending, .. } => {
                if pending.len() >= capacity {
                    return Enqueue::Full;
                }
                pending.push_back(frame);
                Enqueue::Queued
            }
            Link::Connected { queue, reset, .. } => match queue.try_send(frame) {
                Ok(()) => Enqueue::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
                // A reset link has its own report on the way to the router
                Err(mpsc::error::TrySendError::Closed(_)) if reset.is_cancelled() => Enqueue::Closing,
                Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Broken,
            },
        }
    }

    /// Tear down the current link, returning frames still waiting for a stream
    pub(crate) fn detach(&mut self) -> VecDeque<Bytes> {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Idle => VecDeque::new(),
            Link::Connecting { pending, .. } => pending,
            Link::Connected { reset, .. } => {
                reset.cancel();
                VecDeque::new()
            }
        }
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Codec shared by both directions of the frame transport
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Split a handshaken stream into framed halves
pub(crate) fn framed(stream: BoxStream) -> (FrameSource, FrameSink) {
    let (read, write) = tokio::io::split(stream);
    (
        FramedRead::new(read, frame_codec()),
        FramedWrite::new(write, frame_codec()),
    )
}

/// Accepting side: send our address, then learn theirs
pub(crate) async fn handshake_responder(
    mut stream: BoxStream,
    peer: PeerId,
    local: HardwareAddr,
) -> Result<(BoxStream, HardwareAddr)> {
    write_address(&mut stream, peer, local).await?;
    let remote = read_address(&mut stream, peer).await?;
    Ok((stream, remote))
}

/// Opening side: learn their address, then send ours
pub(crate) async fn handshake_initiator(
    mut stream: BoxStream,
    peer: PeerId,
    local: HardwareAddr,
) -> Result<(BoxStream, HardwareAddr)> {
    let remote = read_address(&mut stream, peer).await?;
    write_address(&mut stream, peer, local).await?;
    Ok((stream, remote))
}

async fn write_address(stream: &mut BoxStream, peer: PeerId, local: HardwareAddr) -> Result<()> {
    let failed = |e: std::io::Error| Error::Handshake { peer, reason: e.to_string() };
    stream.write_all(local.as_bytes()).await.map_err(failed)?;
    stream.flush().await.map_err(failed)
}

async fn read_address(stream: &mut BoxStream, peer: PeerId) -> Result<HardwareAddr> {
    let mut octets = [0u8; MAC_SIZE];
    stream
        .read_exact(&mut octets)
        .await
        .map_err(|e| Error::Handshake { peer, reason: e.to_string() })?;

    let address = HardwareAddr::new(octets);
    if address.is_broadcast() {
        return Err(Error::Handshake {
            peer,
            reason: "peer claims the broadcast address".into(),
        });
    }
    Ok(address)
}

/// Drain a member's queue onto its stream, in order
pub(crate) async fn deliver(
    peer: PeerId,
    generation: u64,
    mut queue: mpsc::Receiver<Bytes>,
    mut sink: FrameSink,
    reset: CancellationToken,
    control: mpsc::Sender<Control>,
) {
    loop {
        let frame = tokio::select! {
            _ = reset.cancelled() => return,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        let result = tokio::select! {
            _ = reset.cancelled() => return,
            result = sink.send(frame) => result,
        };

        if let Err(e) = result {
            let error = Error::TransportWrite { peer, reason: e.to_string() };
            tracing::warn!("{}", error);
            reset.cancel();
            let _ = control.send(Control::DeliveryFailed { peer, generation }).await;
            return;
        }
    }
}

/// Forward frames from a member's stream to the shared ingoing queue
pub(crate) async fn receive(
    peer: PeerId,
    generation: u64,
    mut source: FrameSource,
    ingoing: mpsc::Sender<Bytes>,
    reset: CancellationToken,
    control: mpsc::Sender<Control>,
) {
    let report = loop {
        let next = tokio::select! {
            _ = reset.cancelled() => return,
            next = source.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                let sent = tokio::select! {
                    _ = reset.cancelled() => return,
                    sent = ingoing.send(frame.freeze()) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                let error = Error::TransportRead { peer, reason: e.to_string() };
                tracing::warn!("{}", error);
                break Control::ReceiveFailed { peer, generation };
            }
            None => {
                tracing::debug!("Stream from {} closed by peer", peer);
                break Control::StreamClosed { peer, generation };
            }
        }
    };

    reset.cancel();
    let _ = control.send(report).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (BoxStream, BoxStream) {
        let (a, b) = tokio::io::duplex(4096);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn test_handshake_exchanges_addresses() {
        let (a, b) = pair();
        let a_id = PeerId::random();
        let b_id = PeerId::random();
        let a_mac: HardwareAddr = "aa:aa:aa:aa:aa:01".parse().unwrap();
        let b_mac: HardwareAddr = "bb:bb:bb:bb:bb:02".parse().unwrap();

        let (initiated, accepted) = tokio::join!(
            handshake_initiator(a, b_id, a_mac),
            handshake_responder(b, a_id, b_mac),
        );

        assert_eq!(initiated.unwrap().1, b_mac);
        assert_eq!(accepted.unwrap().1, a_mac);
    }

    #[tokio::test]
    async fn test_handshake_short_read() {
        let (a, mut b) = pair();
        b.write_all(&[0xaa, 0xbb]).await.unwrap();
        drop(b);

        let result = handshake_initiator(a, PeerId::random(), HardwareAddr::random_local()).await;
        assert!(matches!(result, Err(Error::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let (a, b) = pair();
        let (_, sink) = framed(a);
        let (mut source, _) = framed(b);
        let (queue_tx, queue_rx) = mpsc::channel(32);
        let (control_tx, _control_rx) = mpsc::channel(8);
        let reset = CancellationToken::new();

        tokio::spawn(deliver(PeerId::random(), 1, queue_rx, sink, reset.clone(), control_tx));

        queue_tx.send(Bytes::from_static(b"F1")).await.unwrap();
        queue_tx.send(Bytes::from_static(b"F2")).await.unwrap();

        assert_eq!(&source.next().await.unwrap().unwrap()[..], b"F1");
        assert_eq!(&source.next().await.unwrap().unwrap()[..], b"F2");
        reset.cancel();
    }

    #[tokio::test]
    async fn test_receive_reports_closure() {
        let (a, b) = pair();
        let (_, mut sink) = framed(a);
        let (source, _keep) = framed(b);
        let (ingoing_tx, mut ingoing_rx) = mpsc::channel(32);
        let (control_tx, mut control_rx) = mpsc::channel(8);
        let peer = PeerId::random();

        tokio::spawn(receive(peer, 7, source, ingoing_tx, CancellationToken::new(), control_tx));

        sink.send(Bytes::from_static(b"frame")).await.unwrap();
        assert_eq!(&ingoing_rx.recv().await.unwrap()[..], b"frame");

        drop(sink);
        match control_rx.recv().await.unwrap() {
            Control::StreamClosed { peer: closed, generation } => {
                assert_eq!(closed, peer);
                assert_eq!(generation, 7);
            }
            _ => panic!("expected StreamClosed"),
        }
    }

    #[test]
    fn test_enqueue_states() {
        let mut member = Member::new(PeerId::random());
        assert_eq!(member.enqueue(Bytes::from_static(b"x"), 2), Enqueue::Broken);

        member.link = Link::Connecting { attempt: 1, pending: VecDeque::new() };
        assert_eq!(member.enqueue(Bytes::from_static(b"1"), 2), Enqueue::Queued);
        assert_eq!(member.enqueue(Bytes::from_static(b"2"), 2), Enqueue::Queued);
        assert_eq!(member.enqueue(Bytes::from_static(b"3"), 2), Enqueue::Full);
        assert_eq!(member.status().link, LinkState::Connecting);

        let pending = member.detach();
        assert_eq!(pending.len(), 2);
        assert!(member.is_idle());

        let (tx, rx) = mpsc::channel(1);
        let reset = CancellationToken::new();
        member.link = Link::Connected {
            generation: 2,
            initiator: member.peer,
            queue: tx,
            reset: reset.clone(),
        };
        assert_eq!(member.enqueue(Bytes::from_static(b"a"), 1), Enqueue::Queued);
        assert_eq!(member.enqueue(Bytes::from_static(b"b"), 1), Enqueue::Full);
        drop(rx);
        assert_eq!(member.enqueue(Bytes::from_static(b"c"), 1), Enqueue::Broken);

        // Once the link is reset its close report decides, not the enqueue
        reset.cancel();
        assert_eq!(member.enqueue(Bytes::from_static(b"d"), 1), Enqueue::Closing);

        drop(member);
        assert!(reset.is_cancelled());
    }

    #[tokio::test]
    async fn test_receive_reports_read_failure() {
        let (a, b) = pair();
        let (_, mut sink) = framed(a);
        let (source, _keep) = framed(b);
        let (ingoing_tx, _ingoing_rx) = mpsc::channel(32);
        let (control_tx, mut control_rx) = mpsc::channel(8);
        let reset = CancellationToken::new();
        let peer = PeerId::random();

        tokio::spawn(receive(peer, 3, source, ingoing_tx, reset.clone(), control_tx));

        // Length prefix beyond the frame limit is a read error, not a close
        let oversized = (MAX_FRAME_LEN as u16 + 1).to_be_bytes();
        sink.get_mut().write_all(&oversized).await.unwrap();
        sink.get_mut().flush().await.unwrap();

        match control_rx.recv().await.unwrap() {
            Control::ReceiveFailed { peer: failed, generation } => {
                assert_eq!(failed, peer);
                assert_eq!(generation, 3);
            }
            _ => panic!("expected ReceiveFailed"),
        }
        assert!(reset.is_cancelled());
    }
}
