use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::framing::{decode_stream_frame, encode_stream_frame, FrameKind, DEFAULT_MAX_PACKET};
use crate::packet::{Packet, PacketTracker};
use crate::traits::{Host, HostEvent, PeerId, Transport};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Packet sessions over Unix domain sockets.
///
/// Each session is one stream connection carrying length-prefixed frames. The
/// accepting host writes a session frame first; the connecting host reports
/// [`HostEvent::Connected`] only once it has read that frame.
#[derive(Debug, Clone)]
pub struct UdsTransport {
    max_packet: usize,
    socket_mode: u32,
}

impl UdsTransport {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    pub fn new() -> Self {
        Self {
            max_packet: DEFAULT_MAX_PACKET,
            socket_mode: Self::DEFAULT_SOCKET_MODE,
        }
    }

    /// Override the largest packet accepted from a stream.
    pub fn with_max_packet(mut self, max_packet: usize) -> Self {
        self.max_packet = max_packet;
        self
    }

    /// Override the permission mode applied to bound socket paths.
    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }
}

impl Default for UdsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UdsTransport {
    fn bind(&self, address: &str, tracker: Arc<PacketTracker>) -> Result<Box<dyn Host>> {
        let listener = BoundSocket::bind(Path::new(address), self.socket_mode)?;
        Ok(Box::new(UdsHost::new(
            Some(listener),
            Some(address.to_string()),
            tracker,
            self.max_packet,
        )))
    }

    fn client(&self, tracker: Arc<PacketTracker>) -> Result<Box<dyn Host>> {
        Ok(Box::new(UdsHost::new(None, None, tracker, self.max_packet)))
    }
}

struct BoundSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

impl BoundSocket {
    fn bind(path: &Path, mode: u32) -> Result<Self> {
        let path = path.to_path_buf();
        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        // Remove a stale socket, but never a file of another kind.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            created_inode: (metadata.dev(), metadata.ino()),
            path,
        })
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        let (expected_dev, expected_ino) = self.created_inode;
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

struct StreamSession {
    stream: UnixStream,
    inbound: BytesMut,
    outbound: BytesMut,
    confirmed: bool,
    closing: bool,
}

enum Progress {
    Open,
    Closed,
}

impl StreamSession {
    fn new(stream: UnixStream, confirmed: bool) -> Self {
        Self {
            stream,
            inbound: BytesMut::with_capacity(READ_CHUNK_SIZE),
            outbound: BytesMut::new(),
            confirmed,
            closing: false,
        }
    }

    fn flush(&mut self) -> Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(TransportError::Io(ErrorKind::WriteZero.into())),
                Ok(n) => {
                    let _ = self.outbound.split_to(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
        Ok(())
    }

    fn fill(&mut self) -> Result<Progress> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Progress::Open),
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }
}

/// A [`Host`] over Unix domain sockets.
pub struct UdsHost {
    listener: Option<BoundSocket>,
    address: Option<String>,
    tracker: Arc<PacketTracker>,
    max_packet: usize,
    sessions: HashMap<PeerId, StreamSession>,
    next_peer: u64,
}

impl UdsHost {
    fn new(
        listener: Option<BoundSocket>,
        address: Option<String>,
        tracker: Arc<PacketTracker>,
        max_packet: usize,
    ) -> Self {
        Self {
            listener,
            address,
            tracker,
            max_packet,
            sessions: HashMap::new(),
            next_peer: 1,
        }
    }

    fn allocate_peer(&mut self) -> PeerId {
        let peer = PeerId(self.next_peer);
        self.next_peer += 1;
        peer
    }

    fn accept_pending(&mut self, events: &mut Vec<HostEvent>) -> Result<()> {
        loop {
            let accepted = match &self.listener {
                Some(bound) => bound.listener.accept(),
                None => return Ok(()),
            };
            let stream = match accepted {
                Ok((stream, _addr)) => stream,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            };
            stream.set_nonblocking(true)?;

            let peer = self.allocate_peer();
            let mut session = StreamSession::new(stream, true);
            encode_stream_frame(FrameKind::Session, &[], &mut session.outbound)?;
            self.sessions.insert(peer, session);
            debug!(%peer, "accepted unix socket session");
            events.push(HostEvent::Connected(peer));
        }
    }

    fn pump(&mut self, peer: PeerId, events: &mut Vec<HostEvent>) -> Result<Progress> {
        let tracker = Arc::clone(&self.tracker);
        let max_packet = self.max_packet;
        let Some(session) = self.sessions.get_mut(&peer) else {
            return Ok(Progress::Closed);
        };

        session.flush()?;
        if session.closing {
            if session.outbound.is_empty() {
                let _ = session.stream.shutdown(std::net::Shutdown::Both);
                return Ok(Progress::Closed);
            }
            return Ok(Progress::Open);
        }

        let progress = session.fill()?;
        while let Some((kind, payload)) = decode_stream_frame(&mut session.inbound, max_packet)? {
            match kind {
                FrameKind::Session if !session.confirmed => {
                    session.confirmed = true;
                    events.push(HostEvent::Connected(peer));
                }
                FrameKind::Session => trace!(%peer, "duplicate session frame ignored"),
                FrameKind::Packet if session.confirmed => {
                    events.push(HostEvent::Received(peer, tracker.alloc(payload)));
                }
                FrameKind::Packet => {
                    return Err(TransportError::InvalidFrame("packet before session frame"));
                }
            }
        }
        Ok(progress)
    }
}

impl Host for UdsHost {
    fn connect(&mut self, address: &str) -> Result<PeerId> {
        if address.is_empty() {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }
        let stream = UnixStream::connect(address).map_err(|source| TransportError::Connect {
            path: PathBuf::from(address),
            source,
        })?;
        stream.set_nonblocking(true)?;

        let peer = self.allocate_peer();
        self.sessions.insert(peer, StreamSession::new(stream, false));
        debug!(address, %peer, "connected unix socket, awaiting session frame");
        Ok(peer)
    }

    fn send(&mut self, peer: PeerId, packet: Packet) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&peer) else {
            packet.destroy();
            return Err(TransportError::UnknownPeer(peer));
        };
        if !session.confirmed {
            packet.destroy();
            return Err(TransportError::NotConnected(peer));
        }
        if packet.len() > self.max_packet {
            let size = packet.len();
            packet.destroy();
            return Err(TransportError::PacketTooLarge {
                size,
                max: self.max_packet,
            });
        }

        let bytes = packet.into_bytes();
        encode_stream_frame(FrameKind::Packet, &bytes, &mut session.outbound)?;
        session.flush()
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.closing = true;
        }
    }

    fn disconnect_now(&mut self, peer: PeerId) {
        if let Some(session) = self.sessions.remove(&peer) {
            let _ = session.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn service(&mut self, events: &mut Vec<HostEvent>) -> Result<()> {
        self.accept_pending(events)?;

        let peers: Vec<PeerId> = self.sessions.keys().copied().collect();
        for peer in peers {
            match self.pump(peer, events) {
                Ok(Progress::Open) => {}
                Ok(Progress::Closed) => {
                    self.sessions.remove(&peer);
                    debug!(%peer, "unix socket session closed");
                    events.push(HostEvent::Disconnected(peer));
                }
                Err(err) => {
                    warn!(%peer, error = %err, "dropping unix socket session");
                    self.sessions.remove(&peer);
                    events.push(HostEvent::Disconnected(peer));
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

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn sock_path(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "chanlink-uds-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("host.sock")
    }

    fn pump_until(
        hosts: &mut [&mut Box<dyn Host>],
        mut done: impl FnMut(&[Vec<HostEvent>]) -> bool,
    ) -> Vec<Vec<HostEvent>> {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut seen: Vec<Vec<HostEvent>> = hosts.iter().map(|_| Vec::new()).collect();
        while Instant::now() < deadline {
            for (host, seen) in hosts.iter_mut().zip(seen.iter_mut()) {
                host.service(seen).expect("service should succeed");
            }
            if done(&seen) {
                return seen;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("hosts did not reach the expected state");
    }

    #[test]
    fn session_confirmed_by_server_frame() {
        let path = sock_path("confirm");
        let tracker = PacketTracker::new();
        let transport = UdsTransport::new();
        let mut server = transport
            .bind(path.to_str().unwrap(), tracker.clone())
            .unwrap();
        let mut client = transport.client(tracker).unwrap();

        let peer = client.connect(path.to_str().unwrap()).unwrap();
        let seen = pump_until(&mut [&mut server, &mut client], |seen| {
            seen[1]
                .iter()
                .any(|e| matches!(e, HostEvent::Connected(p) if *p == peer))
        });
        assert!(seen[0].iter().any(|e| matches!(e, HostEvent::Connected(_))));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn packets_cross_the_socket_in_order() {
        let path = sock_path("order");
        let tracker = PacketTracker::new();
        let transport = UdsTransport::new();
        let mut server = transport
            .bind(path.to_str().unwrap(), tracker.clone())
            .unwrap();
        let mut client = transport.client(tracker.clone()).unwrap();

        let peer = client.connect(path.to_str().unwrap()).unwrap();
        pump_until(&mut [&mut server, &mut client], |seen| {
            seen[1].iter().any(|e| matches!(e, HostEvent::Connected(_)))
        });

        for i in 0..5u8 {
            client.send(peer, tracker.alloc(vec![i; 3])).unwrap();
        }

        let mut seen = pump_until(&mut [&mut server, &mut client], |seen| {
            seen[0]
                .iter()
                .filter(|e| matches!(e, HostEvent::Received(..)))
                .count()
                == 5
        });

        let mut order = Vec::new();
        for event in seen.remove(0) {
            if let HostEvent::Received(_, packet) = event {
                order.push(packet.data()[0]);
                packet.destroy();
            }
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(tracker.leaked(), 0);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let path = sock_path("missing");
        let mut client = UdsTransport::new().client(PacketTracker::new()).unwrap();
        let result = client.connect(path.to_str().unwrap());
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn bind_rejects_existing_non_socket_file() {
        let path = sock_path("regular");
        std::fs::write(&path, b"regular-file").unwrap();
        let result = UdsTransport::new().bind(path.to_str().unwrap(), PacketTracker::new());
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn graceful_disconnect_is_seen_remotely() {
        let path = sock_path("close");
        let tracker = PacketTracker::new();
        let transport = UdsTransport::new();
        let mut server = transport
            .bind(path.to_str().unwrap(), tracker.clone())
            .unwrap();
        let mut client = transport.client(tracker).unwrap();

        let peer = client.connect(path.to_str().unwrap()).unwrap();
        pump_until(&mut [&mut server, &mut client], |seen| {
            seen[1].iter().any(|e| matches!(e, HostEvent::Connected(_)))
        });

        client.disconnect(peer);
        pump_until(&mut [&mut server, &mut client], |seen| {
            seen[0].iter().any(|e| matches!(e, HostEvent::Disconnected(_)))
        });
        assert_eq!(client.peer_count(), 0);

        drop(server);
        assert!(!path.exists(), "socket file should be cleaned up on drop");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
