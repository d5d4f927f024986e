//! Ethernet Frame Helpers
//!
//! Hardware addresses and the header fields the router needs. Frame payloads
//! are never interpreted.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::error::{Error, Result};

/// Interface MTU
pub const MTU: usize = 1500;

/// Size of a hardware address in bytes
pub const MAC_SIZE: usize = 6;

/// Destination (6) + source (6) + ethertype (2)
pub const HEADER_LEN: usize = 14;

/// Largest frame read from or written to the local interface
pub const MAX_FRAME_LEN: usize = MTU + HEADER_LEN;

/// A 6-byte Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddr([u8; MAC_SIZE]);

impl HardwareAddr {
    /// The all-ones broadcast address
    pub const BROADCAST: HardwareAddr = HardwareAddr([0xff; MAC_SIZE]);

    pub const fn new(bytes: [u8; MAC_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build from a slice that must be exactly 6 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let octets: [u8; MAC_SIZE] = bytes.try_into().map_err(|_| {
            Error::Format(format!("hardware address must be {} bytes, got {}", MAC_SIZE, bytes.len()))
        })?;
        Ok(Self(octets))
    }

    /// Random locally administered unicast address
    pub fn random_local() -> Self {
        let mut octets: [u8; MAC_SIZE] = rand::thread_rng().gen();
        octets[0] = (octets[0] | 0x02) & 0xfe;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; MAC_SIZE] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for HardwareAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != MAC_SIZE {
            return Err(Error::Format(format!("invalid hardware address: {}", s)));
        }

        let mut octets = [0u8; MAC_SIZE];
        for (octet, part) in octets.iter_mut().zip(parts) {
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Format(format!("invalid hardware address: {}", s)))?;
        }
        Ok(Self(octets))
    }
}

impl From<[u8; MAC_SIZE]> for HardwareAddr {
    fn from(octets: [u8; MAC_SIZE]) -> Self {
        Self(octets)
    }
}

/// Destination address of a frame, None for runt frames
pub fn destination(frame: &[u8]) -> Option<HardwareAddr> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    HardwareAddr::from_slice(&frame[0..6]).ok()
}

/// Source address of a frame, None for runt frames
pub fn source(frame: &[u8]) -> Option<HardwareAddr> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    HardwareAddr::from_slice(&frame[6..12]).ok()
}

/// Build a frame from header fields and payload
pub fn build_frame(dest: HardwareAddr, src: HardwareAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(dest.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
