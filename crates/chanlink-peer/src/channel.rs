//! Typed channels: one per channel type per connection.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use chanlink_frame::{encode_frame, ChannelTypeId, HEADER_SIZE};
use chanlink_transport::Packet;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::connection::ConnectionCore;
use crate::error::{PeerError, Result};
use crate::payload::Payload;
use crate::registry::ChannelType;
use crate::signal::{Event, Signal};

/// Type-erased view of a channel, as stored by its connection.
pub(crate) trait ChannelSlot: Send + Sync {
    fn id(&self) -> ChannelTypeId;
    fn type_name(&self) -> &'static str;
    fn take_packet(&self, packet: Packet);
    fn update(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Recover the typed channel behind a slot.
pub(crate) fn typed<C: ChannelType>(slot: &Arc<dyn ChannelSlot>) -> Option<Arc<Channel<C>>> {
    Arc::clone(slot).into_any().downcast::<Channel<C>>().ok()
}

/// A typed sub-stream of a [`Connection`](crate::Connection).
///
/// Created with [`Connection::create_channel`](crate::Connection::create_channel).
/// Payloads decoded on the I/O thread wait in the channel's inbound queue
/// until the connection's next `update()`, which fires [`received`](Self::received)
/// once per payload in arrival order.
pub struct Channel<C: ChannelType> {
    id: ChannelTypeId,
    core: Arc<ConnectionCore>,
    inbound_tx: Sender<(C::Payload, Packet)>,
    inbound_rx: Receiver<(C::Payload, Packet)>,
    received: Event<C::Payload>,
    delivering: AtomicBool,
    decode_failures: AtomicU64,
    _marker: PhantomData<fn() -> C>,
}

impl<C: ChannelType> Channel<C> {
    pub(crate) fn new(id: ChannelTypeId, core: Arc<ConnectionCore>) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            id,
            core,
            inbound_tx,
            inbound_rx,
            received: Event::new(),
            delivering: AtomicBool::new(false),
            decode_failures: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// This channel type's numeric id on the wire.
    pub fn id(&self) -> ChannelTypeId {
        self.id
    }

    pub fn type_name(&self) -> &'static str {
        C::type_name()
    }

    /// Serialize `payload` and send it to the remote channel of the same type.
    ///
    /// While the connection is still Pending the packet is held back and
    /// transmitted on activation; that is not an error.
    pub fn send(&self, payload: &C::Payload) -> Result<()> {
        let body = payload.serialize()?;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        encode_frame(self.id, &body, &mut buf);

        let max = self.core.max_packet_size();
        if buf.len() > max {
            return Err(PeerError::PayloadTooLarge {
                size: buf.len(),
                max,
            });
        }

        trace!(
            peer = %self.core.handle(),
            channel = C::type_name(),
            channel_id = self.id,
            len = buf.len(),
            "sending"
        );
        self.core.send_raw(buf.freeze())
    }

    /// Fired on the tick thread once per received payload.
    ///
    /// A callback may call [`Connection::update`](crate::Connection::update),
    /// but the nested update does not deliver this channel's payloads; they stay
    /// queued for the delivery already in progress or the next tick.
    pub fn received(&self) -> Signal<C::Payload> {
        self.received.signal()
    }

    /// Payloads decoded but not yet delivered.
    pub fn pending(&self) -> usize {
        self.inbound_rx.len()
    }

    /// Packets dropped because their payload failed to parse.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    fn accept(&self, packet: Packet) {
        let body = packet.data().get(HEADER_SIZE..).unwrap_or_default();
        match C::Payload::parse(body) {
            Ok(payload) => {
                if let Err(err) = self.inbound_tx.send((payload, packet)) {
                    let (_, packet) = err.into_inner();
                    self.core.retire(packet);
                }
            }
            Err(err) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer = %self.core.handle(),
                    channel = C::type_name(),
                    len = packet.len(),
                    error = %err,
                    "dropping undecodable payload"
                );
                self.core.retire(packet);
            }
        }
    }

    fn deliver(&self) {
        if self.delivering.swap(true, Ordering::Acquire) {
            trace!(
                peer = %self.core.handle(),
                channel = C::type_name(),
                "nested delivery deferred"
            );
            return;
        }
        // Only what is queued now; packets arriving meanwhile wait for the next tick.
        for _ in 0..self.inbound_rx.len() {
            let Ok((payload, packet)) = self.inbound_rx.try_recv() else {
                break;
            };
            self.received.fire(&payload);
            self.core.retire(packet);
        }
        self.delivering.store(false, Ordering::Release);
    }
}

impl<C: ChannelType> ChannelSlot for Channel<C> {
    fn id(&self) -> ChannelTypeId {
        self.id
    }

    fn type_name(&self) -> &'static str {
        C::type_name()
    }

    fn take_packet(&self, packet: Packet) {
        self.accept(packet);
    }

    fn update(&self) {
        self.deliver();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<C: ChannelType> Drop for Channel<C> {
    fn drop(&mut self) {
        let mut released = 0usize;
        while let Ok((_, packet)) = self.inbound_rx.try_recv() {
            self.core.retire(packet);
            released += 1;
        }
        if released > 0 {
            debug!(
                peer = %self.core.handle(),
                channel = C::type_name(),
                released,
                "channel dropped with undelivered packets"
            );
        }
    }
}

impl<C: ChannelType> fmt::Debug for Channel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("type_name", &C::type_name())
            .field("id", &self.id)
            .field("peer", &self.core.handle())
            .field("pending", &self.inbound_rx.len())
            .finish()
    }
}
