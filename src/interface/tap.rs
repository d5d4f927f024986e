//! TAP device management for WolfLAN
//!
//! Creates a Linux TAP interface carrying raw Ethernet frames and drives its
//! non-blocking descriptor from the tokio reactor.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::unix::AsyncFd;

use super::VirtualInterface;
use crate::error::{Error, Result};
use crate::ethernet::HardwareAddr;

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write bit differently
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Kernel limit on interface names, without the trailing NUL
const IFNAMSIZ: usize = 15;

/// Highest index probed when allocating a name
const MAX_INDEX: u32 = 256;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// TAP creation options
#[derive(Debug, Clone)]
pub struct TapOptions {
    /// Name prefix; the first free `<prefix><n>` is used
    pub name_prefix: String,
    /// Optional CIDR address, e.g. `10.0.0.10/24`
    pub address: Option<String>,
    pub mtu: u16,
    /// Address to assign instead of the kernel's random one
    pub hardware_address: Option<HardwareAddr>,
}

impl Default for TapOptions {
    fn default() -> Self {
        Self {
            name_prefix: "tap".into(),
            address: None,
            mtu: crate::ethernet::MTU as u16,
            hardware_address: None,
        }
    }
}

struct TapFd(RawFd);

impl TapFd {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&self, data: &[u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::write(self.0, data.as_ptr() as *const _, data.len()) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for TapFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for TapFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// A Linux TAP device
pub struct TapInterface {
    fd: AsyncFd<TapFd>,
    name: String,
    hardware_address: HardwareAddr,
    closed: AtomicBool,
}

impl TapInterface {
    /// Create and configure a TAP device. Must run inside a tokio runtime.
    pub fn create(options: &TapOptions) -> Result<Self> {
        let name = allocate_name(&options.name_prefix)?;

        let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::LocalInterface(format!(
                "failed to open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            )));
        }
        let fd = TapFd(fd);

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        let ret = unsafe { libc::ioctl(fd.0, TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            return Err(Error::LocalInterface(format!(
                "ioctl TUNSETIFF failed for {}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        let flags = unsafe { libc::fcntl(fd.0, libc::F_GETFL) };
        unsafe { libc::fcntl(fd.0, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(&name)
            .trim_end_matches('\0')
            .to_string();

        configure(&actual_name, options)?;
        let hardware_address = read_hardware_address(&actual_name)?;

        let fd = AsyncFd::new(fd)
            .map_err(|e| Error::LocalInterface(format!("failed to register {}: {}", actual_name, e)))?;

        tracing::info!("Created TAP interface {} ({})", actual_name, hardware_address);
        Ok(Self {
            fd,
            name: actual_name,
            hardware_address,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::LocalInterface(format!("{} is closed", self.name)));
        }
        Ok(())
    }

    fn io_error(&self, op: &str, e: std::io::Error) -> Error {
        Error::LocalInterface(format!("{} on {} failed: {}", op, self.name, e))
    }
}

#[async_trait::async_trait]
impl VirtualInterface for TapInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_address(&self) -> HardwareAddr {
        self.hardware_address
    }

    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            self.check_open()?;
            let mut guard = self.fd.readable().await.map_err(|e| self.io_error("read", e))?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result.map_err(|e| self.io_error("read", e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        loop {
            self.check_open()?;
            let mut guard = self.fd.writable().await.map_err(|e| self.io_error("write", e))?;
            match guard.try_io(|inner| inner.get_ref().write(frame)) {
                Ok(result) => return result.map(|_| ()).map_err(|e| self.io_error("write", e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Closing TAP interface {}", self.name);
        }
        Ok(())
    }
}

/// Pick the first `<prefix><n>` not already present on the host
fn allocate_name(prefix: &str) -> Result<String> {
    allocate_name_in(Path::new("/sys/class/net"), prefix)
}

fn allocate_name_in(sysfs: &Path, prefix: &str) -> Result<String> {
    for index in 0..MAX_INDEX {
        let name = format!("{}{}", prefix, index);
        if name.len() > IFNAMSIZ {
            break;
        }
        if !sysfs.join(&name).exists() {
            return Ok(name);
        }
    }

    Err(Error::LocalInterface(format!("no free interface name with prefix {}", prefix)))
}

fn configure(name: &str, options: &TapOptions) -> Result<()> {
    if let Some(mac) = options.hardware_address {
        run_ip(&["link", "set", "dev", name, "address", &mac.to_string()])?;
    }

    if let Some(ref address) = options.address {
        run_ip(&["addr", "add", address, "dev", name])?;
    }

    if let Err(e) = run_ip(&["link", "set", "dev", name, "mtu", &options.mtu.to_string()]) {
        tracing::warn!("Failed to set MTU on {}: {}", name, e);
    }

    run_ip(&["link", "set", "dev", name, "up"])
}

fn run_ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip")
        .args(args)
        .status()
        .map_err(|e| Error::LocalInterface(format!("failed to run ip: {}", e)))?;
    if !status.success() {
        return Err(Error::LocalInterface(format!("`ip {}` failed", args.join(" "))));
    }
    Ok(())
}

fn read_hardware_address(name: &str) -> Result<HardwareAddr> {
    let path = Path::new("/sys/class/net").join(name).join("address");
    let text = std::fs::read_to_string(&path)
        .map_err(|e| Error::LocalInterface(format!("failed to read {}: {}", path.display(), e)))?;
    text.parse()
}
