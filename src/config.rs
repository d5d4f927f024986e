//! WolfLAN Configuration
//!
//! This module provides configuration structures for a WolfLAN node.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::ethernet::{HardwareAddr, MTU};
use crate::network::NetworkOptions;
use crate::overlay::{Locator, PeerId};

/// Main WolfLAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfLanConfig {
    /// Virtual network configuration
    pub network: NetworkConfig,

    /// Overlay node configuration
    pub node: NodeConfig,

    /// Local TAP interface configuration
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Member discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Virtual network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network name; members rendezvous and announce under it
    pub name: String,
}

/// Overlay node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind for overlay connections
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Persistent overlay identity (random per start when unset)
    #[serde(default)]
    pub identity: Option<String>,
}

/// Local TAP interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name prefix; the first free `<prefix><n>` is used
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Address in CIDR notation (e.g. 10.0.0.10/24)
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Hardware address to assign (kernel picks one when unset)
    #[serde(default)]
    pub hardware_address: Option<String>,
}

/// How members are discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Rendezvous lookup and connect at startup
    Lookup,
    /// Announcements on a group channel
    Group,
    #[default]
    Both,
}

impl DiscoveryMode {
    pub fn uses_lookup(&self) -> bool {
        matches!(self, DiscoveryMode::Lookup | DiscoveryMode::Both)
    }

    pub fn uses_group(&self) -> bool {
        matches!(self, DiscoveryMode::Group | DiscoveryMode::Both)
    }
}

/// Member discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub mode: DiscoveryMode,

    /// Static bootstrap peers (host:port or /ip4/../tcp/.. locators)
    #[serde(default)]
    pub peers: Vec<String>,

    /// Use UDP broadcast on the local subnet
    #[serde(default = "default_true")]
    pub broadcast: bool,

    /// UDP port for broadcast lookup
    #[serde(default = "default_lookup_port")]
    pub lookup_port: u16,

    /// UDP port for the broadcast group channel
    #[serde(default = "default_group_port")]
    pub group_port: u16,

    /// Per-peer connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-bootstrap timeout in seconds
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:9600".to_string()
}

fn default_name_prefix() -> String {
    "tap".to_string()
}

fn default_mtu() -> u16 {
    crate::ethernet::MTU as u16
}

fn default_true() -> bool {
    true
}

fn default_lookup_port() -> u16 {
    crate::discovery::DEFAULT_LOOKUP_PORT
}

fn default_group_port() -> u16 {
    crate::discovery::DEFAULT_GROUP_PORT
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_bootstrap_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            address: None,
            mtu: default_mtu(),
            hardware_address: None,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::default(),
            peers: Vec::new(),
            broadcast: true,
            lookup_port: default_lookup_port(),
            group_port: default_group_port(),
            connect_timeout_secs: default_connect_timeout(),
            bootstrap_timeout_secs: default_bootstrap_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WolfLanConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfLanConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.network.name.trim().is_empty() {
            return Err(crate::Error::Config("network.name cannot be empty".into()));
        }

        if self.node.bind_address.parse::<SocketAddr>().is_err() {
            return Err(crate::Error::Config(format!(
                "node.bind_address is not a socket address: {}",
                self.node.bind_address
            )));
        }

        self.advertise_socket_addr()?;
        self.local_identity()?;
        self.hardware_address()?;
        self.bootstrap_peers()?;

        if let Some(ref cidr) = self.interface.address {
            validate_cidr(cidr)?;
        }

        // The frame transport carries at most MAX_FRAME_LEN bytes
        if !(576..=MTU).contains(&usize::from(self.interface.mtu)) {
            return Err(crate::Error::Config(format!(
                "interface.mtu must be between 576 and {}, got {}",
                MTU, self.interface.mtu
            )));
        }

        if self.interface.name_prefix.is_empty() || self.interface.name_prefix.len() > 12 {
            return Err(crate::Error::Config("interface.name_prefix must be 1-12 characters".into()));
        }

        if self.discovery.connect_timeout_secs == 0 || self.discovery.bootstrap_timeout_secs == 0 {
            return Err(crate::Error::Config("discovery timeouts must be positive".into()));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Parsed advertise address, when one is configured
    pub fn advertise_socket_addr(&self) -> crate::Result<Option<SocketAddr>> {
        match self.node.advertise_address {
            Some(ref addr) => addr.parse().map(Some).map_err(|_| {
                crate::Error::Config(format!("node.advertise_address is not a socket address: {}", addr))
            }),
            None => Ok(None),
        }
    }

    /// Configured overlay identity, if any
    pub fn local_identity(&self) -> crate::Result<Option<PeerId>> {
        match self.node.identity {
            Some(ref id) => id
                .parse()
                .map(Some)
                .map_err(|e| crate::Error::Config(format!("node.identity: {}", e))),
            None => Ok(None),
        }
    }

    /// Configured interface hardware address, if any
    pub fn hardware_address(&self) -> crate::Result<Option<HardwareAddr>> {
        match self.interface.hardware_address {
            Some(ref mac) => {
                let mac: HardwareAddr = mac
                    .parse()
                    .map_err(|e| crate::Error::Config(format!("interface.hardware_address: {}", e)))?;
                if mac.is_broadcast() || mac.octets()[0] & 0x01 != 0 {
                    return Err(crate::Error::Config(
                        "interface.hardware_address must be a unicast address".into(),
                    ));
                }
                Ok(Some(mac))
            }
            None => Ok(None),
        }
    }

    /// Static bootstrap peers as locators
    pub fn bootstrap_peers(&self) -> crate::Result<Vec<Locator>> {
        self.discovery
            .peers
            .iter()
            .map(|p| {
                p.parse()
                    .map_err(|e| crate::Error::Config(format!("discovery.peers: {}", e)))
            })
            .collect()
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.connect_timeout_secs)
    }

    /// Get bootstrap timeout as Duration
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.bootstrap_timeout_secs)
    }

    /// Router and bootstrap tuning derived from this configuration
    pub fn network_options(&self) -> NetworkOptions {
        NetworkOptions {
            connect_timeout: self.connect_timeout(),
            bootstrap_timeout: self.bootstrap_timeout(),
            ..NetworkOptions::default()
        }
    }
}

fn validate_cidr(cidr: &str) -> crate::Result<()> {
    let invalid = || crate::Error::Config(format!("interface.address is not a CIDR address: {}", cidr));

    let (ip, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let ip: std::net::IpAddr = ip.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[network]
name = "demo"

[node]
bind_address = "0.0.0.0:9600"
advertise_address = "192.168.1.10:9600"
identity = "6f1c1f54-3c57-4c3b-9f8e-0c2a4d1b7e21"

[interface]
address = "10.0.0.10/24"
hardware_address = "aa:aa:aa:aa:aa:01"

[discovery]
mode = "lookup"
peers = ["192.168.1.11:9600", "/ip4/192.168.1.12/tcp/9600"]
broadcast = false
"#;

        let config = WolfLanConfig::from_str(toml).unwrap();
        assert_eq!(config.network.name, "demo");
        assert_eq!(config.advertise_address(), "192.168.1.10:9600");
        assert_eq!(config.discovery.mode, DiscoveryMode::Lookup);
        assert!(!config.discovery.mode.uses_group());
        assert_eq!(config.bootstrap_peers().unwrap().len(), 2);
        assert_eq!(
            config.hardware_address().unwrap(),
            Some("aa:aa:aa:aa:aa:01".parse().unwrap())
        );
        assert!(config.local_identity().unwrap().is_some());
    }

    #[test]
    fn test_defaults() {
        let config = WolfLanConfig::from_str("[network]\nname = \"demo\"\n[node]\n").unwrap();

        assert_eq!(config.node.bind_address, "0.0.0.0:9600");
        assert_eq!(config.advertise_address(), "0.0.0.0:9600");
        assert_eq!(config.interface.name_prefix, "tap");
        assert_eq!(config.interface.mtu, 1500);
        assert_eq!(config.discovery.mode, DiscoveryMode::Both);
        assert!(config.discovery.broadcast);
        assert_eq!(config.discovery.lookup_port, 9610);
        assert_eq!(config.discovery.group_port, 9611);
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.bootstrap_timeout(), Duration::from_secs(30));
        assert_eq!(config.logging.level, "info");

        let options = config.network_options();
        assert_eq!(options.connect_timeout, Duration::from_secs(15));
        assert_eq!(options.queue_capacity, 32);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            "[network]\nname = \"\"\n[node]\n",
            "[network]\nname = \"demo\"\n[node]\nbind_address = \"nowhere\"\n",
            "[network]\nname = \"demo\"\n[node]\nidentity = \"bogus\"\n",
            "[network]\nname = \"demo\"\n[node]\n[interface]\naddress = \"10.0.0.10/40\"\n",
            "[network]\nname = \"demo\"\n[node]\n[interface]\nmtu = 100\n",
            "[network]\nname = \"demo\"\n[node]\n[interface]\nmtu = 9000\n",
            "[network]\nname = \"demo\"\n[node]\n[interface]\nhardware_address = \"ff:ff:ff:ff:ff:ff\"\n",
            "[network]\nname = \"demo\"\n[node]\n[discovery]\nconnect_timeout_secs = 0\n",
            "[network]\nname = \"demo\"\n[node]\n[discovery]\npeers = [\"not a peer\"]\n",
        ];

        for case in cases {
            assert!(
                matches!(WolfLanConfig::from_str(case), Err(crate::Error::Config(_))),
                "accepted: {}",
                case
            );
        }

        assert!(matches!(
            WolfLanConfig::from_str("[network]\n"),
            Err(crate::Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nname = \"lab\"\n\n[node]\nbind_address = \"127.0.0.1:9700\"").unwrap();

        let config = WolfLanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.network.name, "lab");
        assert_eq!(config.node.bind_address, "127.0.0.1:9700");
    }
}
