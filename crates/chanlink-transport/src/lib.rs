//! Reliable packet transport boundary for chanlink.
//!
//! Everything above this crate talks to a [`Host`]: a non-blocking, polled
//! endpoint that opens peer sessions, moves whole packets and reports
//! connect/receive/disconnect events. Two hosts are provided:
//! - [`MemoryNetwork`]: in-process, reliable and ordered (tests, demos)
//! - [`UdsTransport`]: packet sessions over Unix domain sockets
//!
//! Packets are owned values. Whoever holds a [`Packet`] is responsible for
//! destroying it; the shared [`PacketTracker`] counts allocations so leaks are
//! observable.

pub mod error;
pub mod framing;
pub mod memory;
pub mod packet;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::{MemoryHost, MemoryNetwork};
pub use packet::{Packet, PacketTracker};
pub use traits::{Host, HostEvent, PeerId, Transport};

#[cfg(unix)]
pub use uds::{UdsHost, UdsTransport};
