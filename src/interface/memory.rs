//! Channel-backed interface
//!
//! The host side is played by a [`MemoryInterfaceHandle`]: frames it injects
//! are what the interface "reads", frames the interface "writes" show up on
//! the handle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::VirtualInterface;
use crate::error::{Error, Result};
use crate::ethernet::HardwareAddr;

const INJECT_CAPACITY: usize = 32;

struct Shared {
    write_count: AtomicUsize,
    fail_writes: AtomicBool,
}

/// In-process virtual interface
pub struct MemoryInterface {
    name: String,
    hardware_address: HardwareAddr,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    written: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
    closed: CancellationToken,
}

/// Host side of a [`MemoryInterface`]
pub struct MemoryInterfaceHandle {
    inject: mpsc::Sender<Bytes>,
    written: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
}

impl MemoryInterface {
    pub fn new(name: &str, hardware_address: HardwareAddr) -> (Self, MemoryInterfaceHandle) {
        let (inject_tx, inject_rx) = mpsc::channel(INJECT_CAPACITY);
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            write_count: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        });

        let interface = Self {
            name: name.to_string(),
            hardware_address,
            inbound: Mutex::new(inject_rx),
            written: written_tx,
            shared: Arc::clone(&shared),
            closed: CancellationToken::new(),
        };
        let handle = MemoryInterfaceHandle {
            inject: inject_tx,
            written: written_rx,
            shared,
        };
        (interface, handle)
    }
}

#[async_trait::async_trait]
impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_address(&self) -> HardwareAddr {
        self.hardware_address
    }

    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.inbound.lock().await;
        let frame = tokio::select! {
            frame = inbound.recv() => frame,
            _ = self.closed.cancelled() => None,
        };

        let frame = frame.ok_or_else(|| Error::LocalInterface(format!("{} is closed", self.name)))?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::LocalInterface(format!("{} is closed", self.name)));
        }
        if self.shared.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::LocalInterface(format!("write to {} failed", self.name)));
        }

        self.shared.write_count.fetch_add(1, Ordering::Relaxed);
        let _ = self.written.send(Bytes::copy_from_slice(frame));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

impl MemoryInterfaceHandle {
    /// Hand a frame to the interface as if the host had sent it
    pub async fn inject(&self, frame: impl Into<Bytes>) -> Result<()> {
        self.inject
            .send(frame.into())
            .await
            .map_err(|_| Error::LocalInterface("interface dropped".into()))
    }

    /// Next frame the interface delivered to the host
    pub async fn next_written(&mut self) -> Option<Bytes> {
        self.written.recv().await
    }

    /// Number of frames delivered to the host so far
    pub fn written_count(&self) -> usize {
        self.shared.write_count.load(Ordering::Relaxed)
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::Relaxed);
    }
}
