use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

/// Allocation accounting shared by every packet a context hands out.
///
/// A packet is either destroyed explicitly or counted as leaked when it is
/// dropped, so `live()` drops back to zero once every packet has been released.
#[derive(Debug, Default)]
pub struct PacketTracker {
    created: AtomicU64,
    destroyed: AtomicU64,
    leaked: AtomicU64,
}

impl PacketTracker {
    /// Create a shareable tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a packet owning `data`.
    pub fn alloc(self: &Arc<Self>, data: impl Into<Bytes>) -> Packet {
        self.created.fetch_add(1, Ordering::Relaxed);
        Packet {
            data: data.into(),
            tracker: Some(Arc::clone(self)),
        }
    }

    /// Packets allocated so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Packets released through [`Packet::destroy`] or handed to the wire.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Packets dropped without being destroyed.
    pub fn leaked(&self) -> u64 {
        self.leaked.load(Ordering::Relaxed)
    }

    /// Packets still owned by someone.
    pub fn live(&self) -> u64 {
        self.created()
            .saturating_sub(self.destroyed())
            .saturating_sub(self.leaked())
    }
}

/// A raw transport packet.
///
/// Packets move between threads by value; there is never more than one owner.
pub struct Packet {
    data: Bytes,
    tracker: Option<Arc<PacketTracker>>,
}

impl Packet {
    /// Packet contents.
    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Cheap handle to the packet contents.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Release the packet's transport resources.
    pub fn destroy(mut self) {
        self.release();
    }

    /// Release the packet and keep its contents, for hosts putting it on the wire.
    pub fn into_bytes(mut self) -> Bytes {
        self.release();
        std::mem::take(&mut self.data)
    }

    fn release(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.leaked.fetch_add(1, Ordering::Relaxed);
            warn!(len = self.data.len(), "packet dropped without being destroyed");
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet").field("len", &self.data.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_is_counted() {
        let tracker = PacketTracker::new();
        let packet = tracker.alloc(&b"abc"[..]);
        assert_eq!(tracker.live(), 1);

        packet.destroy();
        assert_eq!(tracker.created(), 1);
        assert_eq!(tracker.destroyed(), 1);
        assert_eq!(tracker.leaked(), 0);
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn drop_without_destroy_is_a_leak() {
        let tracker = PacketTracker::new();
        drop(tracker.alloc(vec![1, 2, 3]));
        assert_eq!(tracker.leaked(), 1);
        assert_eq!(tracker.destroyed(), 0);
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn into_bytes_releases_and_keeps_contents() {
        let tracker = PacketTracker::new();
        let packet = tracker.alloc(Bytes::from_static(b"wire"));
        let bytes = packet.into_bytes();
        assert_eq!(bytes.as_ref(), b"wire");
        assert_eq!(tracker.destroyed(), 1);
        assert_eq!(tracker.leaked(), 0);
    }
}
