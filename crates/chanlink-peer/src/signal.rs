//! Fan-out notification: an owner-side [`Event`] and subscriber-side [`Signal`].
//!
//! Callbacks run on whichever thread fires the event, which for everything in
//! this crate is the tick thread. Firing takes no lock while callbacks run, so
//! a callback may connect, disconnect or fire other signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

type Callback<T> = Box<dyn FnMut(&T) + Send>;

struct Slot<T> {
    id: u64,
    live: AtomicBool,
    callback: Mutex<Callback<T>>,
}

struct Slots<T> {
    next_id: u64,
    slots: Vec<Arc<Slot<T>>>,
}

trait SlotSet: Send + Sync {
    fn contains(&self, id: u64) -> bool;
    fn disconnect(&self, id: u64);
}

impl<T: 'static> SlotSet for Mutex<Slots<T>> {
    fn contains(&self, id: u64) -> bool {
        self.lock().slots.iter().any(|slot| slot.id == id)
    }

    fn disconnect(&self, id: u64) {
        let mut slots = self.lock();
        if let Some(pos) = slots.slots.iter().position(|slot| slot.id == id) {
            let slot = slots.slots.remove(pos);
            slot.live.store(false, Ordering::Release);
        }
    }
}

/// The firing side of a signal. Owned by whatever produces notifications.
pub struct Event<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: 'static> Event<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 1,
                slots: Vec::new(),
            })),
        }
    }

    /// Subscribe handle for this event.
    pub fn signal(&self) -> Signal<T> {
        Signal {
            slots: Arc::clone(&self.slots),
        }
    }

    /// Call every connected callback with `value`, in connection order.
    ///
    /// Callbacks connected during the call are not invoked until the next
    /// fire; callbacks disconnected during the call are skipped. A callback
    /// that fires its own event re-entrantly is not invoked recursively.
    pub fn fire(&self, value: &T) {
        let snapshot: Vec<Arc<Slot<T>>> = self.slots.lock().slots.clone();
        for slot in snapshot {
            if !slot.live.load(Ordering::Acquire) {
                continue;
            }
            match slot.callback.try_lock() {
                Some(mut callback) => (*callback)(value),
                None => debug!(slot = slot.id, "callback already running; skipped"),
            }
        }
    }

    /// Number of connected callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().slots.len()
    }
}

impl<T: 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribe handle to an [`Event`].
pub struct Signal<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T: 'static> Signal<T> {
    /// Connect a callback. It stays connected until the returned handle (and
    /// every clone of it) is dropped, or [`SignalConnection::disconnect`] is called.
    #[must_use = "dropping the SignalConnection disconnects the callback; use detach() to keep it"]
    pub fn connect<F>(&self, callback: F) -> SignalConnection
    where
        F: FnMut(&T) + Send + 'static,
    {
        let id = {
            let mut slots = self.slots.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.slots.push(Arc::new(Slot {
                id,
                live: AtomicBool::new(true),
                callback: Mutex::new(Box::new(callback)),
            }));
            id
        };

        let slots: Arc<dyn SlotSet> = self.slots.clone();
        SignalConnection {
            link: Arc::new(Link {
                slots: Arc::downgrade(&slots),
                id,
                detached: AtomicBool::new(false),
            }),
        }
    }
}

struct Link {
    slots: Weak<dyn SlotSet>,
    id: u64,
    detached: AtomicBool,
}

impl Link {
    fn disconnect(&self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.disconnect(self.id);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::Acquire) {
            self.disconnect();
        }
    }
}

/// Handle to one connected callback.
#[derive(Clone)]
pub struct SignalConnection {
    link: Arc<Link>,
}

impl SignalConnection {
    /// Remove the callback now.
    pub fn disconnect(self) {
        self.link.disconnect();
    }

    /// Keep the callback connected for as long as the event lives.
    pub fn detach(self) {
        self.link.detached.store(true, Ordering::Release);
    }

    /// Whether the callback is still registered.
    pub fn is_connected(&self) -> bool {
        self.link
            .slots
            .upgrade()
            .is_some_and(|slots| slots.contains(self.link.id))
    }
}

impl std::fmt::Debug for SignalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalConnection")
            .field("id", &self.link.id)
            .finish()
    }
}
