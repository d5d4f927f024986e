//! Connection notifier
//!
//! A peer can reach us before any announcement does. Every overlay
//! connection becomes a membership candidate; the router ignores the ones it
//! already tracks.

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::router::{Candidate, Control};
use crate::overlay::OverlayEvent;

pub(crate) async fn run(
    mut events: broadcast::Receiver<OverlayEvent>,
    control: mpsc::Sender<Control>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(OverlayEvent::Connected(peer)) => {
                tracing::debug!("Overlay connected to {}", peer);
                if control.send(Control::Candidate(Candidate::connected(peer))).await.is_err() {
                    break;
                }
            }
            Ok(OverlayEvent::Disconnected(peer)) => {
                tracing::debug!("Overlay lost {}", peer);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} overlay events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::PeerId;

    #[tokio::test]
    async fn test_connections_become_candidates() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let (control_tx, mut control_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(events_rx, control_tx, shutdown.clone()));

        let peer = PeerId::random();
        events_tx.send(OverlayEvent::Disconnected(PeerId::random())).unwrap();
        events_tx.send(OverlayEvent::Connected(peer)).unwrap();

        match control_rx.recv().await.unwrap() {
            Control::Candidate(candidate) => {
                assert_eq!(candidate.peer, peer);
                assert!(candidate.hardware_address.is_none());
            }
            _ => panic!("expected a candidate"),
        }

        shutdown.cancel();
        handle.await.unwrap();
    }
}
