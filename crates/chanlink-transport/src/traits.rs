use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::packet::{Packet, PacketTracker};

/// Host-local identifier of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Something that happened on a host since the last [`Host::service`] call.
#[derive(Debug)]
pub enum HostEvent {
    /// A session was established: accepted on a listening host, or confirmed
    /// by the remote end on a connecting host.
    Connected(PeerId),
    /// A session ended, either side having closed it.
    Disconnected(PeerId),
    /// A whole packet arrived. The receiver owns it from here on.
    Received(PeerId, Packet),
}

/// A polled, non-blocking packet endpoint.
///
/// A host is driven from exactly one thread (the I/O thread). None of its
/// methods block.
pub trait Host: Send {
    /// Start opening a session. The peer is usable once [`HostEvent::Connected`]
    /// is reported for it.
    fn connect(&mut self, address: &str) -> Result<PeerId>;

    /// Queue a packet for reliable, in-order delivery. The host takes ownership
    /// and releases the packet once it has been copied to the wire.
    fn send(&mut self, peer: PeerId, packet: Packet) -> Result<()>;

    /// Graceful close: deliver what is queued, then end the session.
    fn disconnect(&mut self, peer: PeerId);

    /// Forced close: drop the session immediately without notifying the peer
    /// through an orderly shutdown.
    fn disconnect_now(&mut self, peer: PeerId);

    /// Move bytes and append whatever happened to `events`.
    fn service(&mut self, events: &mut Vec<HostEvent>) -> Result<()>;

    /// Address this host listens on, if any.
    fn local_address(&self) -> Option<&str>;

    /// Number of sessions this host currently tracks.
    fn peer_count(&self) -> usize;
}

/// Factory for hosts of one transport kind.
pub trait Transport: Send + Sync {
    /// Create a host listening on `address`.
    fn bind(&self, address: &str, tracker: Arc<PacketTracker>) -> Result<Box<dyn Host>>;

    /// Create a host used only for outgoing sessions.
    fn client(&self, tracker: Arc<PacketTracker>) -> Result<Box<dyn Host>>;
}
