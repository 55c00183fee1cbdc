//! Connections: one transport session multiplexing many typed channels.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chanlink_frame::{classify, ChannelAnnounce, ChannelTypeId, FrameError, Inbound};
use chanlink_transport::{Packet, PacketTracker};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use tracing::{debug, trace, warn};

use crate::channel::{typed, Channel, ChannelSlot};
use crate::error::{PeerError, Result};
use crate::io::{submit, IoCommand, LifecycleEvent, PeerHandle};
use crate::registry::{ChannelType, ChannelTypeRegistry};
use crate::signal::{Event, Signal};

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Connection lifecycle.
///
/// Outgoing connections start `Pending` and become `Active` once the transport
/// confirms the session, or `TimedOut` if that takes longer than the activation
/// timeout. Incoming connections start `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Active,
    Closing,
    TimedOut,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Pending => 0,
            ConnectionState::Active => 1,
            ConnectionState::Closing => 2,
            ConnectionState::TimedOut => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::TimedOut,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

/// Outcome of one [`Connection::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Success,
    /// Still waiting for the transport to confirm the session.
    ConnWaiting,
    /// The activation timeout elapsed; the connection is unusable.
    TimedOut,
}

/// A remote channel announce, as delivered by [`Connection::channel_linked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLink {
    pub type_name: String,
    pub remote_id: ChannelTypeId,
}

/// Snapshot of one entry of a connection's remote channel table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChannel {
    pub remote_id: ChannelTypeId,
    pub type_name: String,
    /// Whether a local channel of the same type receives its packets.
    pub bound: bool,
    /// Packets held until a matching local channel exists.
    pub buffered: usize,
}

/// What a connection needs from its context.
#[derive(Clone)]
pub(crate) struct ConnectionEnv {
    pub(crate) registry: Arc<ChannelTypeRegistry>,
    pub(crate) tracker: Arc<PacketTracker>,
    pub(crate) io: Sender<IoCommand>,
    pub(crate) events: Sender<LifecycleEvent>,
    pub(crate) activation_timeout: Duration,
    pub(crate) max_packet_size: usize,
}

/// Connection state shared with its channels.
pub(crate) struct ConnectionCore {
    handle: PeerHandle,
    state: AtomicU8,
    remote_disconnected: AtomicBool,
    disconnect_queued: AtomicBool,
    /// `Some` while sends must wait for activation.
    outbound: Mutex<Option<VecDeque<Packet>>>,
    retired_tx: Sender<Packet>,
    retired_rx: Receiver<Packet>,
    io: Sender<IoCommand>,
    tracker: Arc<PacketTracker>,
    max_packet_size: usize,
}

impl ConnectionCore {
    fn new(handle: PeerHandle, initial: ConnectionState, env: &ConnectionEnv) -> Self {
        let (retired_tx, retired_rx) = crossbeam_channel::unbounded();
        let outbound = (initial == ConnectionState::Pending).then(VecDeque::new);
        Self {
            handle,
            state: AtomicU8::new(initial.to_u8()),
            remote_disconnected: AtomicBool::new(false),
            disconnect_queued: AtomicBool::new(false),
            outbound: Mutex::new(outbound),
            retired_tx,
            retired_rx,
            io: env.io.clone(),
            tracker: Arc::clone(&env.tracker),
            max_packet_size: env.max_packet_size,
        }
    }

    pub(crate) fn handle(&self) -> PeerHandle {
        self.handle
    }

    pub(crate) fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to Closing from any state but TimedOut.
    fn begin_closing(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match ConnectionState::from_u8(current) {
                ConnectionState::Closing | ConnectionState::TimedOut => return false,
                _ => {}
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Transmit a framed packet, or hold it while the connection is Pending.
    pub(crate) fn send_raw(&self, bytes: Bytes) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::TimedOut
        ) {
            return Err(PeerError::Closed);
        }

        let packet = self.tracker.alloc(bytes);
        let mut outbound = self.outbound.lock();
        match outbound.as_mut() {
            Some(backlog) => {
                trace!(peer = %self.handle, len = packet.len(), "held until activation");
                backlog.push_back(packet);
            }
            None => submit(
                &self.io,
                IoCommand::Send {
                    handle: self.handle,
                    packet,
                },
            ),
        }
        Ok(())
    }

    /// Hand a consumed packet back for destruction on the next update.
    pub(crate) fn retire(&self, packet: Packet) {
        if let Err(err) = self.retired_tx.send(packet) {
            err.into_inner().destroy();
        }
    }

    fn destroy_retired(&self) -> usize {
        let mut destroyed = 0;
        while let Ok(packet) = self.retired_rx.try_recv() {
            packet.destroy();
            destroyed += 1;
        }
        destroyed
    }

    /// Release the outbound backlog to the I/O thread in send order.
    fn flush_outbound(&self) -> usize {
        let mut outbound = self.outbound.lock();
        let backlog = outbound.take().unwrap_or_default();
        let flushed = backlog.len();
        for packet in backlog {
            submit(
                &self.io,
                IoCommand::Send {
                    handle: self.handle,
                    packet,
                },
            );
        }
        flushed
    }

    fn discard_outbound(&self) {
        if let Some(backlog) = self.outbound.lock().as_mut() {
            for packet in backlog.drain(..) {
                packet.destroy();
            }
        }
    }

    fn enqueue_disconnect(&self) {
        if self.remote_disconnected.load(Ordering::Acquire) {
            return;
        }
        if self.disconnect_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        submit(&self.io, IoCommand::Disconnect(self.handle));
    }
}

impl Drop for ConnectionCore {
    fn drop(&mut self) {
        self.destroy_retired();
        if let Some(backlog) = self.outbound.get_mut().take() {
            for packet in backlog {
                packet.destroy();
            }
        }
    }
}

struct RemoteChannelInfo {
    type_name: String,
    channel: Option<Arc<dyn ChannelSlot>>,
    pending: VecDeque<Packet>,
}

enum Routed {
    Announce(ChannelAnnounce),
    Data(ChannelTypeId),
    BadAnnounce(FrameError),
    Malformed(FrameError),
}

/// One logical session with a remote peer.
///
/// Channels are created per type with [`create_channel`](Self::create_channel);
/// each announces itself to the remote end, which routes packets for it by
/// the announced id. Packets for a remote channel with no local counterpart
/// yet are buffered and delivered once the local channel exists.
///
/// `update()` must be called from the tick thread; every application callback
/// runs there.
pub struct Connection {
    core: Arc<ConnectionCore>,
    direction: Direction,
    created_at: Instant,
    activation_timeout: Duration,
    registry: Arc<ChannelTypeRegistry>,
    local: RwLock<Vec<Arc<dyn ChannelSlot>>>,
    remote: RwLock<HashMap<ChannelTypeId, RemoteChannelInfo>>,
    /// `Some` while received packets must wait for activation.
    inbound: Mutex<Option<VecDeque<Packet>>>,
    links_tx: Sender<ChannelLink>,
    links_rx: Receiver<ChannelLink>,
    linked: Event<ChannelLink>,
    events: Sender<LifecycleEvent>,
}

impl Connection {
    pub(crate) fn new(direction: Direction, handle: PeerHandle, env: &ConnectionEnv) -> Self {
        let initial = match direction {
            Direction::Outgoing => ConnectionState::Pending,
            Direction::Incoming => ConnectionState::Active,
        };
        let (links_tx, links_rx) = crossbeam_channel::unbounded();
        debug!(peer = %handle, ?direction, state = %initial, "connection created");

        Self {
            core: Arc::new(ConnectionCore::new(handle, initial, env)),
            direction,
            created_at: Instant::now(),
            activation_timeout: env.activation_timeout,
            registry: Arc::clone(&env.registry),
            local: RwLock::new(Vec::new()),
            remote: RwLock::new(HashMap::new()),
            inbound: Mutex::new((initial == ConnectionState::Pending).then(VecDeque::new)),
            links_tx,
            links_rx,
            linked: Event::new(),
            events: env.events.clone(),
        }
    }

    /// The channel of type `C`, created and announced if it does not exist yet.
    ///
    /// Packets the remote end sent for this type before it existed locally are
    /// queued for delivery on the next `update()`, in arrival order.
    pub fn create_channel<C: ChannelType>(&self) -> Arc<Channel<C>> {
        let mut local = self.local.write();
        if let Some(existing) = local.iter().find_map(typed::<C>) {
            return existing;
        }

        let id = self.registry.id_of::<C>();
        let channel = Arc::new(Channel::<C>::new(id, Arc::clone(&self.core)));
        let slot: Arc<dyn ChannelSlot> = channel.clone();
        local.push(Arc::clone(&slot));
        debug!(
            peer = %self.core.handle,
            channel = C::type_name(),
            channel_id = id,
            "channel created"
        );

        let announce = ChannelAnnounce::new(C::type_name(), id).encode();
        if let Err(err) = self.core.send_raw(announce) {
            debug!(peer = %self.core.handle, channel = C::type_name(), error = %err, "channel announce not sent");
        }

        let mut remote = self.remote.write();
        for (remote_id, info) in remote.iter_mut() {
            if info.channel.is_some() || info.type_name != C::type_name() {
                continue;
            }
            info.channel = Some(Arc::clone(&slot));
            let buffered = info.pending.len();
            for packet in info.pending.drain(..) {
                slot.take_packet(packet);
            }
            debug!(
                peer = %self.core.handle,
                channel = C::type_name(),
                remote_id = *remote_id,
                buffered,
                "channel bound to remote"
            );
        }

        channel
    }

    /// The channel of type `C`, if it has been created.
    pub fn channel<C: ChannelType>(&self) -> Option<Arc<Channel<C>>> {
        self.local.read().iter().find_map(typed::<C>)
    }

    /// Tear down the local channel of type `C`.
    ///
    /// Its undelivered packets are released, and packets the remote end keeps
    /// sending for it are buffered again until the channel is recreated.
    pub fn remove_channel<C: ChannelType>(&self) -> bool {
        let mut local = self.local.write();
        let Some(pos) = local.iter().position(|slot| typed::<C>(slot).is_some()) else {
            return false;
        };
        let slot = local.remove(pos);
        let id = slot.id();

        let mut remote = self.remote.write();
        for info in remote.values_mut() {
            if info.channel.as_ref().is_some_and(|bound| bound.id() == id) {
                info.channel = None;
            }
        }
        debug!(peer = %self.core.handle, channel = C::type_name(), "channel removed");
        true
    }

    /// Number of local channels.
    pub fn channel_count(&self) -> usize {
        self.local.read().len()
    }

    /// Fired on the tick thread for every channel announce received.
    pub fn channel_linked(&self) -> Signal<ChannelLink> {
        self.linked.signal()
    }

    /// Per-tick work: activation timeout, link notifications, channel
    /// delivery, and destruction of consumed packets.
    pub fn update(&self) -> UpdateResult {
        match self.core.state() {
            ConnectionState::Pending => {
                if self.created_at.elapsed() >= self.activation_timeout
                    && self
                        .core
                        .transition(ConnectionState::Pending, ConnectionState::TimedOut)
                {
                    self.time_out();
                    return UpdateResult::TimedOut;
                }
                self.core.destroy_retired();
                return UpdateResult::ConnWaiting;
            }
            ConnectionState::TimedOut => return UpdateResult::TimedOut,
            ConnectionState::Active | ConnectionState::Closing => {}
        }

        let links: Vec<ChannelLink> = self.links_rx.try_iter().collect();
        for link in &links {
            self.linked.fire(link);
        }

        let channels: Vec<Arc<dyn ChannelSlot>> = self.local.read().clone();
        for channel in &channels {
            channel.update();
        }

        self.core.destroy_retired();
        UpdateResult::Success
    }

    /// Close the connection: pending and future sends fail, the transport
    /// session is closed gracefully on the I/O thread, and the owning context
    /// releases its reference.
    pub fn request_close(&self) {
        if !self.core.begin_closing() {
            return;
        }
        debug!(peer = %self.core.handle, "close requested");
        self.core.enqueue_disconnect();
        let _ = self.events.send(LifecycleEvent::Released(self.core.handle));
    }

    pub fn peer(&self) -> PeerHandle {
        self.core.handle
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_active(&self) -> bool {
        self.core.state() == ConnectionState::Active
    }

    pub fn is_remote_disconnected(&self) -> bool {
        self.core.remote_disconnected.load(Ordering::Acquire)
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Remote channel table, ordered by remote id.
    pub fn remote_channels(&self) -> Vec<RemoteChannel> {
        let remote = self.remote.read();
        let mut channels: Vec<RemoteChannel> = remote
            .iter()
            .map(|(id, info)| RemoteChannel {
                remote_id: *id,
                type_name: info.type_name.clone(),
                bound: info.channel.is_some(),
                buffered: info.pending.len(),
            })
            .collect();
        channels.sort_by_key(|channel| channel.remote_id);
        channels
    }

    /// Entry point for packets received on this connection's session (I/O thread).
    pub(crate) fn handle_raw_packet(&self, packet: Packet) {
        {
            let mut inbound = self.inbound.lock();
            if let Some(backlog) = inbound.as_mut() {
                trace!(peer = %self.core.handle, len = packet.len(), "held until activation");
                backlog.push_back(packet);
                return;
            }
        }
        self.route(packet);
    }

    /// Transport confirmed the session (I/O thread). Replays held inbound
    /// packets, then releases held outbound packets, both in arrival order.
    pub(crate) fn activate(&self) -> bool {
        if !self
            .core
            .transition(ConnectionState::Pending, ConnectionState::Active)
        {
            return false;
        }

        let replay = self.inbound.lock().take().unwrap_or_default();
        let replayed = replay.len();
        for packet in replay {
            self.route(packet);
        }
        let flushed = self.core.flush_outbound();

        debug!(peer = %self.core.handle, replayed, flushed, "connection activated");
        true
    }

    /// The session is gone; the peer handle must not be touched again.
    pub(crate) fn mark_remote_disconnected(&self) {
        self.core.remote_disconnected.store(true, Ordering::Release);
        self.core.begin_closing();
        debug!(peer = %self.core.handle, "remote disconnected");
    }

    fn time_out(&self) {
        warn!(
            peer = %self.core.handle,
            timeout = ?self.activation_timeout,
            "connection activation timed out"
        );
        self.core.remote_disconnected.store(true, Ordering::Release);
        self.core.disconnect_queued.store(true, Ordering::Release);
        submit(&self.core.io, IoCommand::DisconnectNow(self.core.handle));

        if let Some(backlog) = self.inbound.lock().as_mut() {
            for packet in backlog.drain(..) {
                packet.destroy();
            }
        }
        self.core.discard_outbound();
    }

    fn route(&self, packet: Packet) {
        if matches!(
            self.core.state(),
            ConnectionState::Closing | ConnectionState::TimedOut
        ) {
            trace!(peer = %self.core.handle, len = packet.len(), "dropping packet for closed connection");
            packet.destroy();
            return;
        }

        let routed = match classify(packet.data()) {
            Ok(Inbound::Announce(Ok(announce))) => Routed::Announce(announce),
            Ok(Inbound::Announce(Err(err))) => Routed::BadAnnounce(err),
            Ok(Inbound::Data(frame)) => Routed::Data(frame.id),
            Err(err) => Routed::Malformed(err),
        };

        match routed {
            Routed::Announce(announce) => {
                packet.destroy();
                self.link_remote(announce);
            }
            Routed::Data(id) => self.route_data(id, packet),
            Routed::BadAnnounce(err) => {
                warn!(peer = %self.core.handle, len = packet.len(), error = %err, "dropping malformed channel announce");
                packet.destroy();
            }
            Routed::Malformed(err) => {
                warn!(peer = %self.core.handle, len = packet.len(), error = %err, "dropping malformed packet");
                packet.destroy();
            }
        }
    }

    fn route_data(&self, id: ChannelTypeId, packet: Packet) {
        let remote = self.remote.upgradable_read();
        let bound = remote.get(&id).map(|info| info.channel.clone());

        match bound {
            None => {
                drop(remote);
                warn!(
                    peer = %self.core.handle,
                    channel_id = id,
                    len = packet.len(),
                    "dropping packet for unknown channel id"
                );
                packet.destroy();
            }
            Some(Some(channel)) => {
                trace!(peer = %self.core.handle, channel_id = id, len = packet.len(), "routed");
                channel.take_packet(packet);
            }
            Some(None) => {
                let mut remote = RwLockUpgradableReadGuard::upgrade(remote);
                match remote.get_mut(&id) {
                    Some(info) => {
                        trace!(peer = %self.core.handle, channel_id = id, len = packet.len(), "buffered until local channel exists");
                        info.pending.push_back(packet);
                    }
                    None => packet.destroy(),
                }
            }
        }
    }

    fn link_remote(&self, announce: ChannelAnnounce) {
        let ChannelAnnounce { type_name, id } = announce;
        {
            let local = self.local.read();
            let mut remote = self.remote.write();
            let info = remote.entry(id).or_insert_with(|| RemoteChannelInfo {
                type_name: type_name.clone(),
                channel: None,
                pending: VecDeque::new(),
            });

            if info.type_name != type_name {
                debug!(peer = %self.core.handle, remote_id = id, old = %info.type_name, new = %type_name, "remote channel renamed");
                info.type_name = type_name.clone();
                info.channel = None;
                if !info.pending.is_empty() {
                    warn!(
                        peer = %self.core.handle,
                        remote_id = id,
                        dropped = info.pending.len(),
                        "discarding packets buffered under the previous channel name"
                    );
                    for packet in info.pending.drain(..) {
                        packet.destroy();
                    }
                }
            }

            if info.channel.is_none() {
                if let Some(slot) = local.iter().find(|slot| slot.type_name() == type_name) {
                    info.channel = Some(Arc::clone(slot));
                    for packet in info.pending.drain(..) {
                        slot.take_packet(packet);
                    }
                }
            }

            debug!(
                peer = %self.core.handle,
                channel = %type_name,
                remote_id = id,
                bound = info.channel.is_some(),
                "remote channel linked"
            );
        }

        let _ = self.links_tx.send(ChannelLink {
            type_name,
            remote_id: id,
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.core.begin_closing();
        self.core.enqueue_disconnect();

        if let Some(backlog) = self.inbound.get_mut().take() {
            for packet in backlog {
                packet.destroy();
            }
        }
        for info in self.remote.get_mut().values_mut() {
            for packet in info.pending.drain(..) {
                packet.destroy();
            }
        }
        self.local.get_mut().clear();
        self.core.destroy_retired();
        trace!(peer = %self.core.handle, "connection dropped");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.core.handle)
            .field("direction", &self.direction)
            .field("state", &self.core.state())
            .field("channels", &self.local.read().len())
            .finish()
    }
}
