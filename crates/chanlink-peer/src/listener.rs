use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::io::{submit, HostId, IoCommand, PeerHandle};
use crate::signal::{Event, Signal};

/// Accepts inbound sessions on one address.
///
/// Every accepted session becomes an Incoming [`Connection`], reported through
/// [`connected`](Self::connected) on the tick thread; when the session ends the
/// same connection is reported through [`disconnected`](Self::disconnected).
///
/// Dropping the listener closes its host and every session on it.
pub struct Listener {
    host: HostId,
    address: String,
    peers: Mutex<HashSet<PeerHandle>>,
    connected: Event<Arc<Connection>>,
    disconnected: Event<Arc<Connection>>,
    io: Sender<IoCommand>,
}

impl Listener {
    pub(crate) fn new(host: HostId, address: String, io: Sender<IoCommand>) -> Self {
        Self {
            host,
            address,
            peers: Mutex::new(HashSet::new()),
            connected: Event::new(),
            disconnected: Event::new(),
            io,
        }
    }

    /// The address this listener was bound to.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn connected(&self) -> Signal<Arc<Connection>> {
        self.connected.signal()
    }

    pub fn disconnected(&self) -> Signal<Arc<Connection>> {
        self.disconnected.signal()
    }

    /// Whether `peer` is a currently connected session of this listener.
    pub fn is_connected(&self, peer: &PeerHandle) -> bool {
        self.peers.lock().contains(peer)
    }

    /// Number of currently connected sessions.
    pub fn connection_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub(crate) fn on_connected(&self, connection: &Arc<Connection>) {
        self.peers.lock().insert(connection.peer());
        info!(address = %self.address, peer = %connection.peer(), "peer connected");
        self.connected.fire(connection);
    }

    pub(crate) fn on_disconnected(&self, connection: &Arc<Connection>) {
        if !self.peers.lock().remove(&connection.peer()) {
            return;
        }
        info!(address = %self.address, peer = %connection.peer(), "peer disconnected");
        self.disconnected.fire(connection);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        debug!(address = %self.address, host = %self.host, "listener dropped");
        submit(&self.io, IoCommand::RemoveHost(self.host));
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.address)
            .field("host", &self.host)
            .field("connections", &self.peers.lock().len())
            .finish()
    }
}
