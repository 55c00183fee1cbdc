//! State owned by the I/O thread and the commands other threads send it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chanlink_transport::{Host, Packet, PacketTracker, PeerId, Transport, TransportError};
use crossbeam_channel::Sender;
use tracing::{debug, error, trace};

use crate::connection::Connection;

/// Identifies one host inside a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub(crate) u32);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// Transport-level endpoint of a connection: a peer session on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub host: HostId,
    pub peer: PeerId,
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.peer)
    }
}

/// Work handed to the I/O thread.
pub(crate) enum IoCommand {
    Send { handle: PeerHandle, packet: Packet },
    Disconnect(PeerHandle),
    DisconnectNow(PeerHandle),
    RemoveHost(HostId),
    Call(Box<dyn FnOnce(&mut IoContext) + Send>),
}

impl IoCommand {
    /// Release whatever the command owns without running it.
    pub(crate) fn discard(self) {
        if let IoCommand::Send { packet, .. } = self {
            packet.destroy();
        }
    }
}

/// Submit a command, releasing it if the I/O side is gone.
pub(crate) fn submit(io: &Sender<IoCommand>, command: IoCommand) {
    if let Err(err) = io.send(command) {
        trace!("io queue closed, discarding command");
        err.into_inner().discard();
    }
}

/// Lifecycle notifications ferried from the I/O thread to the tick thread.
pub(crate) enum LifecycleEvent {
    Accepted {
        listener: HostId,
        connection: Arc<Connection>,
    },
    Activated(Arc<Connection>),
    Closed(Arc<Connection>),
    Released(PeerHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostRole {
    Outgoing,
    Listener,
}

struct HostEntry {
    host: Box<dyn Host>,
    role: HostRole,
}

/// Everything the I/O thread owns: the hosts and the peer-to-connection map.
///
/// Code queued with [`NetworkContext::enqueue_io`](crate::NetworkContext::enqueue_io)
/// receives exclusive access to it.
pub struct IoContext {
    hosts: HashMap<HostId, HostEntry>,
    next_host: u32,
    outgoing: Option<HostId>,
    connections: HashMap<PeerHandle, Weak<Connection>>,
    events: Sender<LifecycleEvent>,
}

impl IoContext {
    pub(crate) fn new(events: Sender<LifecycleEvent>) -> Self {
        Self {
            hosts: HashMap::new(),
            next_host: 1,
            outgoing: None,
            connections: HashMap::new(),
            events,
        }
    }

    /// Mutable access to a host.
    pub fn host_mut(&mut self, id: HostId) -> Option<&mut (dyn Host + 'static)> {
        self.hosts.get_mut(&id).map(|entry| entry.host.as_mut())
    }

    /// Ids of every host, oldest first.
    pub fn host_ids(&self) -> Vec<HostId> {
        let mut ids: Vec<HostId> = self.hosts.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Transmit a packet on a peer session.
    pub fn send(&mut self, handle: PeerHandle, packet: Packet) -> Result<(), TransportError> {
        match self.hosts.get_mut(&handle.host) {
            Some(entry) => entry.host.send(handle.peer, packet),
            None => {
                packet.destroy();
                Err(TransportError::UnknownPeer(handle.peer))
            }
        }
    }

    /// Gracefully close a peer session and forget its connection.
    pub fn disconnect(&mut self, handle: PeerHandle) {
        self.connections.remove(&handle);
        if let Some(entry) = self.hosts.get_mut(&handle.host) {
            entry.host.disconnect(handle.peer);
        }
    }

    /// Drop a peer session immediately and forget its connection.
    pub fn disconnect_now(&mut self, handle: PeerHandle) {
        self.connections.remove(&handle);
        if let Some(entry) = self.hosts.get_mut(&handle.host) {
            entry.host.disconnect_now(handle.peer);
        }
    }

    /// Number of peer sessions with a live connection.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn add_host(&mut self, host: Box<dyn Host>, role: HostRole) -> HostId {
        let id = HostId(self.next_host);
        self.next_host += 1;
        self.hosts.insert(id, HostEntry { host, role });
        id
    }

    /// The host used for outgoing connections, created on first use.
    pub(crate) fn outgoing_host(
        &mut self,
        transport: &dyn Transport,
        tracker: &Arc<PacketTracker>,
    ) -> Result<HostId, TransportError> {
        if let Some(id) = self.outgoing {
            return Ok(id);
        }
        let host = transport.client(Arc::clone(tracker))?;
        let id = self.add_host(host, HostRole::Outgoing);
        debug!(host = %id, "outgoing host created");
        self.outgoing = Some(id);
        Ok(id)
    }

    pub(crate) fn role(&self, id: HostId) -> Option<HostRole> {
        self.hosts.get(&id).map(|entry| entry.role)
    }

    pub(crate) fn service_host(
        &mut self,
        id: HostId,
        events: &mut Vec<chanlink_transport::HostEvent>,
    ) -> Result<(), TransportError> {
        match self.hosts.get_mut(&id) {
            Some(entry) => entry.host.service(events),
            None => Ok(()),
        }
    }

    pub(crate) fn register(&mut self, handle: PeerHandle, connection: &Arc<Connection>) {
        self.connections.insert(handle, Arc::downgrade(connection));
    }

    pub(crate) fn connection(&mut self, handle: PeerHandle) -> Option<Arc<Connection>> {
        let connection = self.connections.get(&handle)?.upgrade();
        if connection.is_none() {
            self.connections.remove(&handle);
        }
        connection
    }

    pub(crate) fn unregister(&mut self, handle: PeerHandle) -> Option<Arc<Connection>> {
        self.connections.remove(&handle)?.upgrade()
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        // The receiver lives as long as the context; a send can only fail
        // while the context itself is being torn down.
        let _ = self.events.send(event);
    }

    pub(crate) fn run(&mut self, command: IoCommand) {
        match command {
            IoCommand::Send { handle, packet } => {
                let len = packet.len();
                if let Err(err) = self.send(handle, packet) {
                    error!(peer = %handle, len, error = %err, "send failed");
                }
            }
            IoCommand::Disconnect(handle) => {
                debug!(peer = %handle, "disconnecting");
                self.disconnect(handle);
            }
            IoCommand::DisconnectNow(handle) => {
                debug!(peer = %handle, "forcing disconnect");
                self.disconnect_now(handle);
            }
            IoCommand::RemoveHost(id) => self.remove_host(id),
            IoCommand::Call(f) => f(self),
        }
    }

    fn remove_host(&mut self, id: HostId) {
        if self.hosts.remove(&id).is_none() {
            return;
        }
        if self.outgoing == Some(id) {
            self.outgoing = None;
        }
        debug!(host = %id, "host removed");

        let orphaned: Vec<PeerHandle> = self
            .connections
            .keys()
            .filter(|handle| handle.host == id)
            .copied()
            .collect();
        for handle in orphaned {
            if let Some(connection) = self.unregister(handle) {
                connection.mark_remote_disconnected();
                self.emit(LifecycleEvent::Closed(connection));
            }
        }
    }
}
