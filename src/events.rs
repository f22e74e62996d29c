//! Change-notification plumbing for long-poll and event-stream endpoints.
//!
//! Player backends announce "something changed" as a bitmask of event kinds;
//! each open event stream owns an [`EventListener`] holding the kinds it cares
//! about. [`EventDispatcher::dispatch`] ORs the intersection into every
//! listener's atomic pending field — listeners are polled, never called, so
//! the dispatcher lock is held only for the set iteration and a backend thread
//! can fire events without ever waiting on a handler.

use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

/// Bitmask of player event kinds.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EventSet(u32);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    /// Playback state, position, volume, active track.
    pub const PLAYER: EventSet = EventSet(1 << 0);
    /// Playlists added, removed, renamed or reordered.
    pub const PLAYLISTS: EventSet = EventSet(1 << 1);
    /// Items of some playlist changed.
    pub const PLAYLIST_ITEMS: EventSet = EventSet(1 << 2);
    /// Play queue contents changed.
    pub const PLAY_QUEUE: EventSet = EventSet(1 << 3);
    /// Output device configuration changed.
    pub const OUTPUTS: EventSet = EventSet(1 << 4);

    /// All kinds; the mask used by full-state update streams.
    pub const ALL: EventSet = EventSet(0b1_1111);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        EventSet(bits)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersect(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

/// Registration shared between a listener handle and its dispatcher.
struct ListenerSlot {
    mask: u32,
    pending: AtomicU32,
}

struct DispatcherInner {
    listeners: Mutex<Vec<Arc<ListenerSlot>>>,
}

/// Fan-out point for player change notifications.
///
/// Cheap to clone; all clones share one listener set.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        EventDispatcher {
            inner: Arc::new(DispatcherInner {
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener interested in the given event kinds.
    ///
    /// The listener deregisters itself when dropped; a dispatch racing the
    /// drop either sees the slot (and ORs into bits nobody will read) or
    /// doesn't — removal and iteration are gated by the same lock.
    #[must_use]
    pub fn create_listener(&self, mask: EventSet) -> EventListener {
        let slot = Arc::new(ListenerSlot {
            mask: mask.bits(),
            pending: AtomicU32::new(0),
        });
        self.inner.listeners.lock().push(Arc::clone(&slot));
        debug!(mask = mask.bits(), "event listener registered");
        EventListener {
            slot,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// OR the intersection of `events` with each listener's mask into its
    /// pending bits. Never blocks on or calls into listeners.
    pub fn dispatch(&self, events: EventSet) {
        if events.is_empty() {
            return;
        }
        let listeners = self.inner.listeners.lock();
        for slot in listeners.iter() {
            let relevant = events.intersect(EventSet::from_bits(slot.mask));
            if !relevant.is_empty() {
                slot.pending.fetch_or(relevant.bits(), Ordering::AcqRel);
            }
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

/// Polled receiver for the event kinds selected at registration.
pub struct EventListener {
    slot: Arc<ListenerSlot>,
    dispatcher: Weak<DispatcherInner>,
}

impl EventListener {
    /// Atomically take and clear the pending bits.
    ///
    /// Returns [`EventSet::NONE`] until the next dispatch after a read.
    #[must_use]
    pub fn read_events(&self) -> EventSet {
        EventSet::from_bits(self.slot.pending.swap(0, Ordering::AcqRel))
    }

    /// Kinds this listener was registered for.
    #[must_use]
    pub fn mask(&self) -> EventSet {
        EventSet::from_bits(self.slot.mask)
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            let mut listeners = inner.listeners.lock();
            listeners.retain(|slot| !Arc::ptr_eq(slot, &self.slot));
        }
    }
}
