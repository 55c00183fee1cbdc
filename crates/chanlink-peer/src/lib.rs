//! Typed multi-channel connections over a reliable packet transport.
//!
//! A [`Connection`] carries any number of typed [`Channel`]s over one
//! transport session. Neither end needs a shared channel numbering: each
//! channel announces its type name and local id when it is created, and the
//! remote end routes by the announced id from then on.
//!
//! Work is split between two threads. The I/O thread calls
//! [`NetworkContext::poll_io`], which moves packets and routes them into
//! per-channel queues. The tick thread calls [`NetworkContext::update`], which
//! delivers payloads through each channel's [`received`](Channel::received)
//! signal. No application callback ever runs on the I/O thread.

pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod io;
pub mod listener;
pub mod payload;
pub mod registry;
pub mod signal;

pub use chanlink_frame::ChannelTypeId;
pub use chanlink_transport::{MemoryNetwork, PacketTracker, PeerId};
#[cfg(unix)]
pub use chanlink_transport::UdsTransport;

pub use channel::Channel;
pub use config::ContextConfig;
pub use connection::{
    ChannelLink, Connection, ConnectionState, Direction, RemoteChannel, UpdateResult,
};
pub use context::{IoThread, NetworkContext};
pub use error::{DecodeError, EncodeError, PeerError, Result};
pub use io::{HostId, IoContext, PeerHandle};
pub use listener::Listener;
pub use payload::{Json, Payload, RawBytes};
pub use registry::{ChannelType, ChannelTypeRegistry};
pub use signal::{Event, Signal, SignalConnection};
