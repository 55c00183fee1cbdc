//! The context: owns the hosts, the I/O queue and every live connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use chanlink_transport::{HostEvent, PacketTracker, Transport, TransportError};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::ContextConfig;
use crate::connection::{Connection, ConnectionEnv, Direction, UpdateResult};
use crate::error::{PeerError, Result};
use crate::io::{submit, HostId, HostRole, IoCommand, IoContext, LifecycleEvent, PeerHandle};
use crate::listener::Listener;
use crate::registry::ChannelTypeRegistry;
use crate::signal::{Event, Signal};

/// Owns the transport hosts and drives every connection created through it.
///
/// Two entry points split the work between threads:
/// - [`poll_io`](Self::poll_io) on the I/O thread moves packets and routes them
/// - [`update`](Self::update) on the tick thread delivers payloads and lifecycle
///   notifications
///
/// Tests drive both from one thread; applications usually hand `poll_io` to
/// [`spawn_io_thread`](Self::spawn_io_thread). Cloning the context is cheap and
/// yields a handle to the same state.
#[derive(Clone)]
pub struct NetworkContext {
    shared: Arc<ContextShared>,
}

struct ContextShared {
    config: ContextConfig,
    transport: Box<dyn Transport>,
    env: ConnectionEnv,
    io: Mutex<IoContext>,
    io_rx: Receiver<IoCommand>,
    events_rx: Receiver<LifecycleEvent>,
    tick: Mutex<TickState>,
    failed: Event<Arc<Connection>>,
    activated: Event<Arc<Connection>>,
    closed: Event<Arc<Connection>>,
}

#[derive(Default)]
struct TickState {
    connections: Vec<Arc<Connection>>,
    listeners: HashMap<HostId, Weak<Listener>>,
}

impl TickState {
    fn remove(&mut self, connection: &Arc<Connection>) {
        self.connections.retain(|live| !Arc::ptr_eq(live, connection));
    }

    fn listener(&self, host: HostId) -> Option<Arc<Listener>> {
        self.listeners.get(&host).and_then(Weak::upgrade)
    }
}

enum Notice {
    Connected(Option<Arc<Listener>>, Arc<Connection>),
    Activated(Arc<Connection>),
    Closed(Option<Arc<Listener>>, Arc<Connection>),
}

impl NetworkContext {
    /// Create a context with its own channel type registry.
    pub fn new(transport: impl Transport + 'static, config: ContextConfig) -> Self {
        Self::with_registry(transport, config, Arc::new(ChannelTypeRegistry::new()))
    }

    /// Create a context sharing an existing channel type registry.
    pub fn with_registry(
        transport: impl Transport + 'static,
        config: ContextConfig,
        registry: Arc<ChannelTypeRegistry>,
    ) -> Self {
        let (io_tx, io_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let env = ConnectionEnv {
            registry,
            tracker: PacketTracker::new(),
            io: io_tx,
            events: events_tx.clone(),
            activation_timeout: config.activation_timeout,
            max_packet_size: config.max_packet_size,
        };

        Self {
            shared: Arc::new(ContextShared {
                transport: Box::new(transport),
                io: Mutex::new(IoContext::new(events_tx)),
                io_rx,
                events_rx,
                tick: Mutex::new(TickState::default()),
                failed: Event::new(),
                activated: Event::new(),
                closed: Event::new(),
                config,
                env,
            }),
        }
    }

    /// Open an outgoing connection. It starts Pending; sends are held until the
    /// transport confirms the session.
    pub fn create_connection(&self, address: &str) -> Result<Arc<Connection>> {
        let shared = &self.shared;
        let mut io = shared.io.lock();
        if io.connection_count() >= shared.config.max_connections {
            return Err(PeerError::ConnectionLimit(shared.config.max_connections));
        }

        let host = io.outgoing_host(shared.transport.as_ref(), &shared.env.tracker)?;
        let peer = io
            .host_mut(host)
            .ok_or(TransportError::Shutdown)?
            .connect(address)?;
        let handle = PeerHandle { host, peer };
        let connection = Arc::new(Connection::new(Direction::Outgoing, handle, &shared.env));
        io.register(handle, &connection);
        drop(io);

        info!(address, peer = %handle, "connecting");
        shared.tick.lock().connections.push(Arc::clone(&connection));
        Ok(connection)
    }

    /// Accept sessions on `address`.
    pub fn listen_on(&self, address: &str) -> Result<Arc<Listener>> {
        let shared = &self.shared;
        let host = shared
            .transport
            .bind(address, Arc::clone(&shared.env.tracker))?;
        let id = shared.io.lock().add_host(host, HostRole::Listener);

        let listener = Arc::new(Listener::new(id, address.to_string(), shared.env.io.clone()));
        shared
            .tick
            .lock()
            .listeners
            .insert(id, Arc::downgrade(&listener));
        info!(address, host = %id, "listening");
        Ok(listener)
    }

    /// Run `f` on the I/O thread during its next poll, with exclusive access
    /// to the hosts.
    pub fn enqueue_io<F>(&self, f: F)
    where
        F: FnOnce(&mut IoContext) + Send + 'static,
    {
        submit(&self.shared.env.io, IoCommand::Call(Box::new(f)));
    }

    /// One I/O step: run queued I/O work, service every host and route what
    /// happened. Returns the number of host events processed.
    ///
    /// Never blocks on the network. Call from the I/O thread only.
    pub fn poll_io(&self) -> Result<usize> {
        let shared = &self.shared;
        let mut io = shared.io.lock();

        while let Ok(command) = shared.io_rx.try_recv() {
            io.run(command);
        }

        let mut processed = 0;
        let mut events = Vec::new();
        let mut failure = None;
        for host in io.host_ids() {
            let serviced = io.service_host(host, &mut events);
            processed += events.len();
            for event in events.drain(..) {
                shared.dispatch(&mut io, host, event);
            }
            if let Err(err) = serviced {
                warn!(host = %host, error = %err, "host service failed");
                failure.get_or_insert(err);
            }
        }

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(processed),
        }
    }

    /// One tick: deliver lifecycle notifications, then update every connection.
    ///
    /// Connections whose activation timed out are dropped from the context and
    /// reported through [`connection_failed`](Self::connection_failed).
    pub fn update(&self) {
        let shared = &self.shared;
        let events: Vec<LifecycleEvent> = shared.events_rx.try_iter().collect();

        let mut early = Vec::new();
        let mut late = Vec::new();
        let mut closing = Vec::new();
        let connections = {
            let mut tick = shared.tick.lock();
            for event in events {
                match event {
                    LifecycleEvent::Accepted {
                        listener,
                        connection,
                    } => {
                        tick.connections.push(Arc::clone(&connection));
                        early.push(Notice::Connected(tick.listener(listener), connection));
                    }
                    LifecycleEvent::Activated(connection) => {
                        early.push(Notice::Activated(connection));
                    }
                    LifecycleEvent::Closed(connection) => {
                        tick.remove(&connection);
                        closing.push(Arc::clone(&connection));
                        late.push(Notice::Closed(tick.listener(connection.peer().host), connection));
                    }
                    LifecycleEvent::Released(handle) => {
                        tick.connections.retain(|live| live.peer() != handle);
                    }
                }
            }
            tick.listeners.retain(|_, listener| listener.strong_count() > 0);
            tick.connections.clone()
        };

        for notice in &early {
            shared.notify(notice);
        }

        let mut failed = Vec::new();
        for connection in connections.iter().chain(&closing) {
            if connection.update() == UpdateResult::TimedOut {
                failed.push(Arc::clone(connection));
            }
        }
        if !failed.is_empty() {
            let mut tick = shared.tick.lock();
            for connection in &failed {
                tick.remove(connection);
            }
        }

        for notice in &late {
            shared.notify(notice);
        }
        for connection in &failed {
            shared.failed.fire(connection);
        }
    }

    /// Fired when an outgoing connection times out before activation.
    pub fn connection_failed(&self) -> Signal<Arc<Connection>> {
        self.shared.failed.signal()
    }

    /// Fired when an outgoing connection becomes Active.
    pub fn connection_activated(&self) -> Signal<Arc<Connection>> {
        self.shared.activated.signal()
    }

    /// Fired when the remote end of any connection disconnects.
    pub fn connection_closed(&self) -> Signal<Arc<Connection>> {
        self.shared.closed.signal()
    }

    /// Number of connections the context is driving.
    pub fn connection_count(&self) -> usize {
        self.shared.tick.lock().connections.len()
    }

    /// Snapshot of the connections the context is driving.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.tick.lock().connections.clone()
    }

    pub fn registry(&self) -> &Arc<ChannelTypeRegistry> {
        &self.shared.env.registry
    }

    /// Allocation counters for every packet this context handles.
    pub fn packet_tracker(&self) -> &Arc<PacketTracker> {
        &self.shared.env.tracker
    }

    pub fn config(&self) -> &ContextConfig {
        &self.shared.config
    }

    /// Run [`poll_io`](Self::poll_io) on a dedicated thread until the returned
    /// handle is stopped or dropped.
    pub fn spawn_io_thread(&self) -> Result<IoThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let context = self.clone();
        let interval = self.shared.config.io_poll_interval;
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("chanlink-io".to_string())
            .spawn(move || {
                debug!("io thread started");
                while !flag.load(Ordering::Acquire) {
                    match context.poll_io() {
                        Ok(0) => std::thread::sleep(interval),
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "io poll failed");
                            std::thread::sleep(interval);
                        }
                    }
                }
                debug!("io thread stopped");
            })?;

        Ok(IoThread {
            stop,
            handle: Some(handle),
        })
    }
}

impl ContextShared {
    fn dispatch(&self, io: &mut IoContext, host: HostId, event: HostEvent) {
        match event {
            HostEvent::Connected(peer) => {
                let handle = PeerHandle { host, peer };
                if io.role(host) == Some(HostRole::Listener) {
                    self.accept(io, host, handle);
                    return;
                }
                match io.connection(handle) {
                    Some(connection) => {
                        if connection.activate() {
                            io.emit(LifecycleEvent::Activated(connection));
                        }
                    }
                    None => {
                        debug!(peer = %handle, "session confirmed for a dropped connection");
                        io.disconnect(handle);
                    }
                }
            }
            HostEvent::Received(peer, packet) => {
                let handle = PeerHandle { host, peer };
                match io.connection(handle) {
                    Some(connection) => connection.handle_raw_packet(packet),
                    None => {
                        trace!(peer = %handle, len = packet.len(), "packet for unknown session");
                        packet.destroy();
                    }
                }
            }
            HostEvent::Disconnected(peer) => {
                let handle = PeerHandle { host, peer };
                if let Some(connection) = io.unregister(handle) {
                    connection.mark_remote_disconnected();
                    io.emit(LifecycleEvent::Closed(connection));
                }
            }
        }
    }

    fn accept(&self, io: &mut IoContext, listener: HostId, handle: PeerHandle) {
        if io.connection_count() >= self.config.max_connections {
            warn!(
                peer = %handle,
                max = self.config.max_connections,
                "connection limit reached, refusing session"
            );
            io.disconnect_now(handle);
            return;
        }

        let connection = Arc::new(Connection::new(Direction::Incoming, handle, &self.env));
        io.register(handle, &connection);
        debug!(peer = %handle, "session accepted");
        io.emit(LifecycleEvent::Accepted {
            listener,
            connection,
        });
    }

    fn notify(&self, notice: &Notice) {
        match notice {
            Notice::Connected(listener, connection) => {
                if let Some(listener) = listener {
                    listener.on_connected(connection);
                }
            }
            Notice::Activated(connection) => self.activated.fire(connection),
            Notice::Closed(listener, connection) => {
                if let Some(listener) = listener {
                    listener.on_disconnected(connection);
                }
                self.closed.fire(connection);
            }
        }
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        let connections = std::mem::take(&mut self.tick.get_mut().connections);
        drop(connections);
        for event in self.events_rx.try_iter() {
            drop(event);
        }

        // Deliver what the dropped connections queued, including their disconnects.
        let io = self.io.get_mut();
        while let Ok(command) = self.io_rx.try_recv() {
            io.run(command);
        }
        let mut events = Vec::new();
        for host in io.host_ids() {
            if let Err(err) = io.service_host(host, &mut events) {
                trace!(host = %host, error = %err, "final host service failed");
            }
        }
        for event in events {
            if let HostEvent::Received(_, packet) = event {
                packet.destroy();
            }
        }
    }
}

/// Handle to a running I/O thread. Dropping it stops and joins the thread.
pub struct IoThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IoThread {
    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("io thread panicked");
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
