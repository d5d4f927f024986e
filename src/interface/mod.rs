//! Local Interface Module
//!
//! The host-side virtual network adapter the router reads frames from and
//! writes frames to.

mod memory;
#[cfg(target_os = "linux")]
mod tap;

pub use memory::{MemoryInterface, MemoryInterfaceHandle};
#[cfg(target_os = "linux")]
pub use tap::{TapInterface, TapOptions};

use crate::error::Result;
use crate::ethernet::HardwareAddr;

/// Frame source and sink on the local host.
///
/// Methods take `&self` so the reading and the writing task can share one
/// `Arc`. Every failure is reported as [`crate::Error::LocalInterface`].
#[async_trait::async_trait]
pub trait VirtualInterface: Send + Sync {
    /// OS-level interface name
    fn name(&self) -> &str;

    /// Hardware address of the interface
    fn hardware_address(&self) -> HardwareAddr;

    /// Read one raw Ethernet frame into `buf`, returning its length
    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one raw Ethernet frame
    async fn write_frame(&self, frame: &[u8]) -> Result<()>;

    /// Release the interface
    async fn close(&self) -> Result<()>;
}
