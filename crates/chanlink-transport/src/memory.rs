use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::packet::{Packet, PacketTracker};
use crate::traits::{Host, HostEvent, PeerId, Transport};

/// In-process packet network.
///
/// Hosts created from clones of the same `MemoryNetwork` can reach each other
/// by address. Delivery is reliable and ordered per session, and nothing moves
/// until the receiving host is serviced, so two hosts driven from one thread
/// behave deterministically.
///
/// Connecting to an address nobody is bound to never completes: the session
/// stays unconfirmed until the caller gives up on it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_host: u64,
    listeners: HashMap<String, u64>,
    mailboxes: HashMap<u64, VecDeque<Wire>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Endpoint {
    host: u64,
    peer: PeerId,
}

enum Wire {
    Open { from: Endpoint },
    Accept { to: PeerId, from: Endpoint },
    Data { to: PeerId, bytes: Bytes },
    Close { to: PeerId },
}

enum Session {
    Opening,
    Open(Endpoint),
}

impl NetworkState {
    fn register(&mut self) -> u64 {
        self.next_host += 1;
        self.mailboxes.insert(self.next_host, VecDeque::new());
        self.next_host
    }

    fn post(&mut self, host: u64, wire: Wire) {
        // A missing mailbox means the remote host is gone; the session is dead
        // and its disconnect has already been (or will never be) reported.
        if let Some(mailbox) = self.mailboxes.get_mut(&host) {
            mailbox.push_back(wire);
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host listening on `address`.
    pub fn bind(&self, address: &str, tracker: Arc<PacketTracker>) -> Result<MemoryHost> {
        if address.is_empty() {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }

        let mut state = self.state.lock();
        if state.listeners.contains_key(address) {
            return Err(TransportError::AddressInUse(address.to_string()));
        }
        let key = state.register();
        state.listeners.insert(address.to_string(), key);
        debug!(address, host = key, "memory host bound");

        Ok(MemoryHost::new(self.clone(), key, Some(address.to_string()), tracker))
    }

    /// Create a host used only for outgoing sessions.
    pub fn client(&self, tracker: Arc<PacketTracker>) -> MemoryHost {
        let key = self.state.lock().register();
        MemoryHost::new(self.clone(), key, None, tracker)
    }

    /// Whether a host is listening on `address`.
    pub fn is_bound(&self, address: &str) -> bool {
        self.state.lock().listeners.contains_key(address)
    }
}

impl Transport for MemoryNetwork {
    fn bind(&self, address: &str, tracker: Arc<PacketTracker>) -> Result<Box<dyn Host>> {
        Ok(Box::new(MemoryNetwork::bind(self, address, tracker)?))
    }

    fn client(&self, tracker: Arc<PacketTracker>) -> Result<Box<dyn Host>> {
        Ok(Box::new(MemoryNetwork::client(self, tracker)))
    }
}

/// One endpoint on a [`MemoryNetwork`].
pub struct MemoryHost {
    network: MemoryNetwork,
    key: u64,
    address: Option<String>,
    tracker: Arc<PacketTracker>,
    sessions: HashMap<PeerId, Session>,
    next_peer: u64,
    local_events: Vec<HostEvent>,
}

impl MemoryHost {
    fn new(
        network: MemoryNetwork,
        key: u64,
        address: Option<String>,
        tracker: Arc<PacketTracker>,
    ) -> Self {
        Self {
            network,
            key,
            address,
            tracker,
            sessions: HashMap::new(),
            next_peer: 1,
            local_events: Vec::new(),
        }
    }

    fn allocate_peer(&mut self) -> PeerId {
        let peer = PeerId(self.next_peer);
        self.next_peer += 1;
        peer
    }

    fn close(&mut self, peer: PeerId, notify_local: bool) {
        let Some(session) = self.sessions.remove(&peer) else {
            return;
        };
        if let Session::Open(remote) = session {
            self.network
                .state
                .lock()
                .post(remote.host, Wire::Close { to: remote.peer });
        }
        if notify_local {
            self.local_events.push(HostEvent::Disconnected(peer));
        }
    }
}

impl Host for MemoryHost {
    fn connect(&mut self, address: &str) -> Result<PeerId> {
        if address.is_empty() {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }

        let peer = self.allocate_peer();
        self.sessions.insert(peer, Session::Opening);

        let mut state = self.network.state.lock();
        match state.listeners.get(address).copied() {
            Some(listener) => {
                let from = Endpoint {
                    host: self.key,
                    peer,
                };
                state.post(listener, Wire::Open { from });
                trace!(address, %peer, "memory session opening");
            }
            None => debug!(address, %peer, "no memory host bound, session will not confirm"),
        }

        Ok(peer)
    }

    fn send(&mut self, peer: PeerId, packet: Packet) -> Result<()> {
        let remote = match self.sessions.get(&peer) {
            Some(Session::Open(remote)) => *remote,
            Some(Session::Opening) => {
                packet.destroy();
                return Err(TransportError::NotConnected(peer));
            }
            None => {
                packet.destroy();
                return Err(TransportError::UnknownPeer(peer));
            }
        };

        let bytes = packet.into_bytes();
        self.network.state.lock().post(
            remote.host,
            Wire::Data {
                to: remote.peer,
                bytes,
            },
        );
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.close(peer, true);
    }

    fn disconnect_now(&mut self, peer: PeerId) {
        self.close(peer, false);
    }

    fn service(&mut self, events: &mut Vec<HostEvent>) -> Result<()> {
        events.append(&mut self.local_events);

        let inbound = {
            let mut state = self.network.state.lock();
            match state.mailboxes.get_mut(&self.key) {
                Some(mailbox) => std::mem::take(mailbox),
                None => return Err(TransportError::Shutdown),
            }
        };

        for wire in inbound {
            match wire {
                Wire::Open { from } => {
                    let peer = self.allocate_peer();
                    self.sessions.insert(peer, Session::Open(from));
                    self.network.state.lock().post(
                        from.host,
                        Wire::Accept {
                            to: from.peer,
                            from: Endpoint {
                                host: self.key,
                                peer,
                            },
                        },
                    );
                    events.push(HostEvent::Connected(peer));
                }
                Wire::Accept { to, from } => {
                    if let Some(session) = self.sessions.get_mut(&to) {
                        *session = Session::Open(from);
                        events.push(HostEvent::Connected(to));
                    } else {
                        // Given up locally before the remote accepted.
                        self.network
                            .state
                            .lock()
                            .post(from.host, Wire::Close { to: from.peer });
                    }
                }
                Wire::Data { to, bytes } => {
                    if matches!(self.sessions.get(&to), Some(Session::Open(_))) {
                        events.push(HostEvent::Received(to, self.tracker.alloc(bytes)));
                    } else {
                        trace!(peer = %to, len = bytes.len(), "data for closed memory session");
                    }
                }
                Wire::Close { to } => {
                    if self.sessions.remove(&to).is_some() {
                        events.push(HostEvent::Disconnected(to));
                    }
                }
            }
        }

        Ok(())
    }

    fn local_address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    fn peer_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Drop for MemoryHost {
    fn drop(&mut self) {
        let peers: Vec<PeerId> = self.sessions.keys().copied().collect();
        for peer in peers {
            self.close(peer, false);
        }

        let mut state = self.network.state.lock();
        if let Some(address) = &self.address {
            state.listeners.remove(address);
        }
        state.mailboxes.remove(&self.key);
    }
}
