//! Locators
//!
//! Self-delimiting multi-protocol addresses such as
//! `/ip4/10.0.0.2/tcp/7700/peer/<uuid>`. Every component starts with a
//! one-byte protocol code followed by a payload whose length the code fixes,
//! so a locator can be appended to other data without a length prefix.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};

use super::PeerId;
use crate::error::{Error, Result};

const CODE_IP4: u8 = 0x04;
const CODE_TCP: u8 = 0x06;
const CODE_IP6: u8 = 0x29;
const CODE_PEER: u8 = 0xa5;

/// One locator component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    Peer(PeerId),
}

impl Protocol {
    fn code(&self) -> u8 {
        match self {
            Protocol::Ip4(_) => CODE_IP4,
            Protocol::Ip6(_) => CODE_IP6,
            Protocol::Tcp(_) => CODE_TCP,
            Protocol::Peer(_) => CODE_PEER,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code());
        match self {
            Protocol::Ip4(ip) => buf.put_slice(&ip.octets()),
            Protocol::Ip6(ip) => buf.put_slice(&ip.octets()),
            Protocol::Tcp(port) => buf.put_u16(*port),
            Protocol::Peer(id) => buf.put_slice(id.as_bytes()),
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let code = buf.get_u8();
        let need = match code {
            CODE_IP4 => 4,
            CODE_IP6 => 16,
            CODE_TCP => 2,
            CODE_PEER => PeerId::SIZE,
            other => return Err(Error::Format(format!("unknown locator protocol code 0x{:02x}", other))),
        };
        if buf.remaining() < need {
            return Err(Error::Format(format!(
                "truncated locator component 0x{:02x}: need {} bytes, have {}",
                code,
                need,
                buf.remaining()
            )));
        }

        Ok(match code {
            CODE_IP4 => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Protocol::Ip4(Ipv4Addr::from(octets))
            }
            CODE_IP6 => {
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Protocol::Ip6(Ipv6Addr::from(octets))
            }
            CODE_TCP => Protocol::Tcp(buf.get_u16()),
            _ => {
                let mut id = [0u8; PeerId::SIZE];
                buf.copy_to_slice(&mut id);
                Protocol::Peer(PeerId::from_bytes(id))
            }
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{}", ip),
            Protocol::Ip6(ip) => write!(f, "/ip6/{}", ip),
            Protocol::Tcp(port) => write!(f, "/tcp/{}", port),
            Protocol::Peer(id) => write!(f, "/peer/{}", id),
        }
    }
}

/// Address describing how to reach a peer at the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Locator(Vec<Protocol>);

impl Locator {
    pub fn new(components: Vec<Protocol>) -> Self {
        Self(components)
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Self(vec![ip, Protocol::Tcp(addr.port())])
    }

    /// Same locator with the peer component set to `peer`
    pub fn with_peer(&self, peer: PeerId) -> Self {
        let mut components: Vec<Protocol> = self
            .0
            .iter()
            .filter(|c| !matches!(c, Protocol::Peer(_)))
            .copied()
            .collect();
        components.push(Protocol::Peer(peer));
        Self(components)
    }

    pub fn components(&self) -> &[Protocol] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Transport address, when the locator carries an IP and a TCP port
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let mut ip = None;
        let mut port = None;
        for component in &self.0 {
            match component {
                Protocol::Ip4(v4) => ip = Some(IpAddr::V4(*v4)),
                Protocol::Ip6(v6) => ip = Some(IpAddr::V6(*v6)),
                Protocol::Tcp(p) => port = Some(*p),
                Protocol::Peer(_) => {}
            }
        }
        Some(SocketAddr::new(ip?, port?))
    }

    /// True when the locator carries a wildcard IP such as `0.0.0.0`
    pub fn is_unspecified(&self) -> bool {
        self.0.iter().any(|c| match c {
            Protocol::Ip4(ip) => ip.is_unspecified(),
            Protocol::Ip6(ip) => ip.is_unspecified(),
            _ => false,
        })
    }

    /// Replace a wildcard IP with `sender`, the address the locator was
    /// heard from. Other locators come back unchanged.
    pub fn resolve_unspecified(&self, sender: IpAddr) -> Self {
        if !self.is_unspecified() {
            return self.clone();
        }
        let ip = match sender {
            IpAddr::V4(v4) => Protocol::Ip4(v4),
            IpAddr::V6(v6) => Protocol::Ip6(v6),
        };
        let components = self
            .0
            .iter()
            .map(|c| match c {
                Protocol::Ip4(_) | Protocol::Ip6(_) => ip,
                other => *other,
            })
            .collect();
        Self(components)
    }

    /// Identity embedded in the locator, if any
    pub fn peer_id(&self) -> Option<PeerId> {
        self.0.iter().find_map(|c| match c {
            Protocol::Peer(id) => Some(*id),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.0.len() * 17);
        for component in &self.0 {
            component.encode(&mut buf);
        }
        buf.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::Format("empty locator".into()));
        }

        let mut buf = bytes;
        let mut components = Vec::new();
        while buf.has_remaining() {
            components.push(Protocol::decode(&mut buf)?);
        }
        Ok(Self(components))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.0 {
            write!(f, "{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = Error;

    /// Accepts `/ip4/1.2.3.4/tcp/7700[/peer/<id>]` or the `host:port` shorthand
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.starts_with('/') {
            let addr: SocketAddr = s
                .parse()
                .map_err(|_| Error::Format(format!("invalid locator: {}", s)))?;
            return Ok(Self::from_socket_addr(addr));
        }

        let invalid = || Error::Format(format!("invalid locator: {}", s));
        let mut parts = s[1..].split('/');
        let mut components = Vec::new();
        while let Some(name) = parts.next() {
            let value = parts.next().ok_or_else(invalid)?;
            let component = match name {
                "ip4" => Protocol::Ip4(value.parse().map_err(|_| invalid())?),
                "ip6" => Protocol::Ip6(value.parse().map_err(|_| invalid())?),
                "tcp" => Protocol::Tcp(value.parse().map_err(|_| invalid())?),
                "peer" => Protocol::Peer(value.parse()?),
                _ => return Err(invalid()),
            };
            components.push(component);
        }

        if components.is_empty() {
            return Err(invalid());
        }
        Ok(Self(components))
    }
}
