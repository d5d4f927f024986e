//! Peer Info
//!
//! Identity record members exchange to find each other: the hardware
//! address of the remote virtual interface followed by a locator. No
//! separator is needed because locators are self-delimiting.

use crate::error::{Error, Result};
use crate::ethernet::{HardwareAddr, MAC_SIZE};
use crate::overlay::{Locator, PeerId};

/// Smallest valid encoding: a full address and at least one locator byte
pub const MIN_ENCODED_LEN: usize = MAC_SIZE + 1;

/// A member's address identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    hardware_address: HardwareAddr,
    locator: Locator,
}

impl PeerInfo {
    pub fn new(hardware_address: HardwareAddr, locator: Locator) -> Self {
        Self { hardware_address, locator }
    }

    pub fn hardware_address(&self) -> HardwareAddr {
        self.hardware_address
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Overlay identity carried in the locator
    pub fn peer_id(&self) -> Option<PeerId> {
        self.locator.peer_id()
    }

    /// Address bytes followed by locator bytes
    pub fn encode(&self) -> Vec<u8> {
        let locator = self.locator.to_bytes();
        let mut bytes = Vec::with_capacity(MAC_SIZE + locator.len());
        bytes.extend_from_slice(self.hardware_address.as_bytes());
        bytes.extend_from_slice(&locator);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_ENCODED_LEN {
            return Err(Error::Format(format!(
                "peer info needs at least {} bytes, got {}",
                MIN_ENCODED_LEN,
                bytes.len()
            )));
        }

        let hardware_address = HardwareAddr::from_slice(&bytes[..MAC_SIZE])?;
        let locator = Locator::from_bytes(&bytes[MAC_SIZE..])?;
        Ok(Self { hardware_address, locator })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PeerInfo {
        let locator = Locator::from_socket_addr("10.0.0.2:7700".parse().unwrap())
            .with_peer(PeerId::random());
        PeerInfo::new("aa:aa:aa:aa:aa:01".parse().unwrap(), locator)
    }

    #[test]
    fn test_round_trip() {
        let info = sample();
        let bytes = info.encode();

        assert_eq!(&bytes[..MAC_SIZE], info.hardware_address().as_bytes());
        assert_eq!(PeerInfo::decode(&bytes).unwrap(), info);
    }

    #[test]
    fn test_short_buffers_rejected() {
        for len in 0..MIN_ENCODED_LEN {
            let bytes = vec![0x04; len];
            assert!(matches!(PeerInfo::decode(&bytes), Err(Error::Format(_))), "len {}", len);
        }
    }

    #[test]
    fn test_bad_locator_rejected() {
        let mut bytes = sample().encode();
        bytes[MAC_SIZE] = 0xee;
        assert!(matches!(PeerInfo::decode(&bytes), Err(Error::Format(_))));

        // Truncated trailing component
        let mut bytes = sample().encode();
        bytes.pop();
        assert!(matches!(PeerInfo::decode(&bytes), Err(Error::Format(_))));
    }

    #[test]
    fn test_peer_id_from_locator() {
        let info = sample();
        assert_eq!(info.peer_id(), info.locator().peer_id());

        let anonymous = PeerInfo::new(
            HardwareAddr::random_local(),
            Locator::from_socket_addr("10.0.0.3:7700".parse().unwrap()),
        );
        assert_eq!(anonymous.peer_id(), None);
    }
}
