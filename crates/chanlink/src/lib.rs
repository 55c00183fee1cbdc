//! Typed channels multiplexed over one peer-to-peer connection.
//!
//! chanlink lets each end of a connection open channels by type. A channel
//! announces its type name once, and both ends then route its packets by the
//! numeric id the sender assigned, so no shared channel table is needed.
//!
//! # Crate Structure
//!
//! - [`transport`]: packet hosts (in-process network, Unix sockets) and packet accounting
//! - [`frame`]: channel frame header and channel announcements
//! - [`peer`]: connections, channels, listeners and the network context
//! - [`chat`]: the chat channel used by the CLI and demos

pub mod chat;

/// Re-export transport types.
pub mod transport {
    pub use chanlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use chanlink_frame::*;
}

/// Re-export peer types.
pub mod peer {
    pub use chanlink_peer::*;
}

pub use chanlink_peer::{
    Channel, ChannelType, Connection, ContextConfig, Json, Listener, NetworkContext, PeerError,
    RawBytes,
};
