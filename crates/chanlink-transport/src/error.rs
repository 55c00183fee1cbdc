use std::path::PathBuf;

use crate::traits::PeerId;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The address could not be interpreted by this transport.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another host is already bound to the address.
    #[error("address already in use: {0}")]
    AddressInUse(String),

    /// The peer is not known to this host.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The peer exists but its session is not established yet.
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    /// The byte stream under a session is corrupt.
    #[error("invalid stream frame: {0}")]
    InvalidFrame(&'static str),

    /// A packet exceeds the stream framing limit.
    #[error("packet too large ({size} bytes, max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
