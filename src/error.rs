//! WolfLAN Error Types

use thiserror::Error;

use crate::overlay::PeerId;

/// Result type alias for WolfLAN operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfLAN error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Encoding errors
    #[error("Malformed encoding: {0}")]
    Format(String),

    // Overlay errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Failed to open stream to {peer}: {reason}")]
    StreamOpen { peer: PeerId, reason: String },

    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: PeerId, reason: String },

    // Frame transport errors
    #[error("Write to {peer} failed: {reason}")]
    TransportWrite { peer: PeerId, reason: String },

    #[error("Read from {peer} failed: {reason}")]
    TransportRead { peer: PeerId, reason: String },

    // Local virtual interface errors
    #[error("Local interface error: {0}")]
    LocalInterface(String),

    // Discovery errors
    #[error("Discovery error: {0}")]
    Discovery(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error must bring the whole network instance down
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LocalInterface(_))
    }

    /// Check if this error only concerns a single remote peer
    pub fn is_per_peer(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::StreamOpen { .. }
                | Error::Handshake { .. }
                | Error::TransportWrite { .. }
                | Error::TransportRead { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let peer = PeerId::random();

        assert!(Error::LocalInterface("tap0 gone".into()).is_fatal());
        assert!(!Error::LocalInterface("tap0 gone".into()).is_per_peer());

        let write = Error::TransportWrite { peer, reason: "broken pipe".into() };
        assert!(write.is_per_peer());
        assert!(!write.is_fatal());

        assert!(Error::ConnectionTimeout("10.0.0.2:7700".into()).is_per_peer());
        assert!(!Error::Format("short".into()).is_per_peer());
        assert!(!Error::Discovery("no socket".into()).is_fatal());
    }
}
