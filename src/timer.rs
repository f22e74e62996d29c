//! Scheduled callback primitive with a pluggable clock.
//!
//! A [`TimerQueue`] owns a time-ordered set of armed timers; whoever drives
//! the event loop calls [`TimerQueue::execute`] to pop and fire everything
//! due. Transports expose their own timers through [`TimerFactory`], and the
//! queue-backed factory is what the engine (and every test) uses.
//!
//! Firing discipline: the timer's state moves to `WillRestart` (periodic) or
//! `Stopped` (one-shot) *before* the callback runs, so a callback calling
//! `stop`/`run_once`/`run_periodic` on its own timer observes consistent
//! state. A periodic timer reschedules relative to its nominal firing time,
//! skipping whole missed periods — a lagging clock produces one fire per
//! pass, never a catch-up burst.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// Time source for a [`TimerQueue`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Monotonic wall-clock-independent time source.
#[derive(Clone, Copy, Default)]
pub struct SteadyClock;

impl Clock for SteadyClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock advanced by hand.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Callback invoked when a timer fires.
pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// One-shot/periodic scheduled callback handle.
pub trait Timer: Send + Sync {
    /// Arm to fire once after `delay`, replacing any pending schedule.
    fn run_once(&self, delay: Duration);
    /// Arm to fire every `period`, first fire one period from now.
    fn run_periodic(&self, period: Duration);
    /// Disarm. Callable from inside the timer's own callback.
    fn stop(&self);
    /// `true` while armed.
    fn is_active(&self) -> bool;
}

/// Produces timers bound to some scheduling substrate (the engine's
/// [`TimerQueue`], or a transport's native timer wheel).
pub trait TimerFactory: Send + Sync {
    fn create_timer(&self, callback: TimerCallback) -> Arc<dyn Timer>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TimerState {
    Stopped,
    Running,
    /// Transient, only while a periodic timer's callback is on the stack.
    WillRestart,
}

type EntryKey = (Instant, u64);

struct TimerCell {
    state: TimerState,
    period: Duration,
    key: Option<EntryKey>,
    /// Taken out of the cell while the callback runs so the callback can
    /// re-arm or stop its own timer without deadlocking.
    callback: Option<TimerCallback>,
}

struct TimerShared {
    queue: Weak<QueueInner>,
    cell: Mutex<TimerCell>,
}

struct QueueInner {
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<EntryKey, Arc<TimerShared>>>,
    seq: AtomicU64,
}

impl QueueInner {
    fn insert(&self, run_at: Instant, timer: &Arc<TimerShared>) -> EntryKey {
        let key = (run_at, self.seq.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(key, Arc::clone(timer));
        key
    }

    fn remove(&self, key: EntryKey) {
        self.entries.lock().remove(&key);
    }
}

/// Time-ordered set of armed timers sharing one clock.
///
/// Cheap to clone; clones share the same entry set.
#[derive(Clone)]
pub struct TimerQueue {
    inner: Arc<QueueInner>,
}

impl TimerQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        TimerQueue {
            inner: Arc::new(QueueInner {
                clock,
                entries: Mutex::new(BTreeMap::new()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Earliest pending deadline, for event loops that want to sleep exactly
    /// until the next fire.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .entries
            .lock()
            .keys()
            .next()
            .map(|(run_at, _)| *run_at)
    }

    /// Pop and fire every timer whose deadline has passed.
    ///
    /// Callbacks run with no queue or timer lock held.
    pub fn execute(&self) {
        let now = self.inner.clock.now();
        loop {
            let due = {
                let mut entries = self.inner.entries.lock();
                match entries.keys().next().copied() {
                    Some(key) if key.0 <= now => entries
                        .remove(&key)
                        .map(|timer| (key, timer)),
                    _ => None,
                }
            };
            let Some((key, timer)) = due else { break };
            Self::fire(&timer, key.0, now);
        }
    }

    fn fire(shared: &Arc<TimerShared>, firing_time: Instant, now: Instant) {
        let (callback, period) = {
            let mut cell = shared.cell.lock();
            cell.key = None;
            cell.state = if cell.period.is_zero() {
                TimerState::Stopped
            } else {
                TimerState::WillRestart
            };
            (cell.callback.take(), cell.period)
        };

        let Some(mut callback) = callback else { return };
        trace!(periodic = !period.is_zero(), "timer fired");
        callback();

        let mut cell = shared.cell.lock();
        if cell.callback.is_none() {
            cell.callback = Some(callback);
        }
        // Still WillRestart: the callback neither stopped nor re-armed the
        // timer, so schedule the next nominal deadline. Whole missed periods
        // are skipped rather than replayed.
        if cell.state == TimerState::WillRestart {
            let mut next = firing_time + cell.period;
            while next <= now {
                next += cell.period;
            }
            cell.state = TimerState::Running;
            if let Some(queue) = shared.queue.upgrade() {
                cell.key = Some(queue.insert(next, shared));
            } else {
                cell.state = TimerState::Stopped;
            }
        }
    }
}

impl TimerFactory for TimerQueue {
    fn create_timer(&self, callback: TimerCallback) -> Arc<dyn Timer> {
        Arc::new(QueueTimer {
            shared: Arc::new(TimerShared {
                queue: Arc::downgrade(&self.inner),
                cell: Mutex::new(TimerCell {
                    state: TimerState::Stopped,
                    period: Duration::ZERO,
                    key: None,
                    callback: Some(callback),
                }),
            }),
        })
    }
}

/// Timer scheduled by a [`TimerQueue`]. At most one queue entry is
/// outstanding per timer at any moment.
struct QueueTimer {
    shared: Arc<TimerShared>,
}

impl QueueTimer {
    fn schedule(&self, delay: Duration, period: Duration) {
        let Some(queue) = self.shared.queue.upgrade() else {
            return;
        };
        let run_at = queue.clock.now() + delay;
        let mut cell = self.shared.cell.lock();
        if let Some(old) = cell.key.take() {
            queue.remove(old);
        }
        cell.period = period;
        cell.state = TimerState::Running;
        cell.key = Some(queue.insert(run_at, &self.shared));
    }
}

impl Timer for QueueTimer {
    fn run_once(&self, delay: Duration) {
        self.schedule(delay, Duration::ZERO);
    }

    fn run_periodic(&self, period: Duration) {
        self.schedule(period, period);
    }

    fn stop(&self) {
        let mut cell = self.shared.cell.lock();
        if let Some(old) = cell.key.take() {
            if let Some(queue) = self.shared.queue.upgrade() {
                queue.remove(old);
            }
        }
        cell.state = TimerState::Stopped;
    }

    fn is_active(&self) -> bool {
        self.shared.cell.lock().state != TimerState::Stopped
    }
}

impl Drop for QueueTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
