//! Work queues: "run this callback somewhere else", FIFO, fire-and-forget.
//!
//! Three flavors share one contract ([`WorkQueue::enqueue`]):
//!
//! - [`ThreadWorkQueue`] — one dedicated OS thread. The player-control queue
//!   is one of these, so every player mutation is serialized by construction.
//! - [`ThreadPoolWorkQueue`] — N workers draining one shared FIFO, for
//!   filesystem and other utility work.
//! - [`ExternalWorkQueue`] — adapts an embedding host's event loop: the first
//!   enqueue into an empty queue fires the host `schedule()` hook once, and
//!   the host's eventual `drain()` runs everything accumulated since.
//!
//! `enqueue` never fails and never drops work; a callback that panics is
//! caught and logged, and the queue keeps draining.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// FIFO fire-and-forget callback queue.
pub trait WorkQueue: Send + Sync {
    /// Queue `task` for execution. Never blocks on the task, never drops it.
    fn enqueue(&self, task: Task);
}

/// Convenience for enqueueing closures without boxing at every call site.
pub trait WorkQueueExt: WorkQueue {
    fn push<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.enqueue(Box::new(f));
    }
}

impl<Q: WorkQueue + ?Sized> WorkQueueExt for Q {}

fn run_isolated(queue_name: &str, task: Task) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        error!(
            queue = %queue_name,
            panic_message = ?panic,
            "queued callback panicked; queue continues"
        );
    }
}

fn spawn_worker(name: String, rx: Receiver<Task>) -> JoinHandle<()> {
    let thread_name = name.clone();
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            debug!(queue = %name, "worker thread started");
            for task in rx.iter() {
                run_isolated(&name, task);
            }
            debug!(queue = %name, "worker thread exiting");
        })
        // Thread spawning fails only on resource exhaustion at startup.
        .unwrap_or_else(|e| panic!("failed to spawn work queue thread: {e}"))
}

/// Work queue with one dedicated worker thread.
///
/// Callbacks run strictly in submission order, one at a time.
pub struct ThreadWorkQueue {
    name: String,
    tx: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadWorkQueue {
    #[must_use]
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let worker = spawn_worker(name.to_string(), rx);
        ThreadWorkQueue {
            name: name.to_string(),
            tx: Some(tx),
            worker: Some(worker),
        }
    }
}

impl WorkQueue for ThreadWorkQueue {
    fn enqueue(&self, task: Task) {
        if let Some(tx) = &self.tx {
            if tx.send(task).is_err() {
                error!(queue = %self.name, "worker thread is gone; task dropped at shutdown");
            }
        }
    }
}

impl Drop for ThreadWorkQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish the backlog and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Work queue draining one shared FIFO with `workers` threads.
///
/// Dequeue order is FIFO; execution of consecutive tasks may overlap across
/// workers, which is why player mutation never goes here.
pub struct ThreadPoolWorkQueue {
    name: String,
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolWorkQueue {
    #[must_use]
    pub fn new(name: &str, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<Task>();
        let handles = (0..workers)
            .map(|i| spawn_worker(format!("{name}-{i}"), rx.clone()))
            .collect();
        ThreadPoolWorkQueue {
            name: name.to_string(),
            tx: Some(tx),
            workers: handles,
        }
    }
}

impl WorkQueue for ThreadPoolWorkQueue {
    fn enqueue(&self, task: Task) {
        if let Some(tx) = &self.tx {
            if tx.send(task).is_err() {
                error!(queue = %self.name, "worker threads are gone; task dropped at shutdown");
            }
        }
    }
}

impl Drop for ThreadPoolWorkQueue {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

struct ExternalQueueInner {
    tasks: Mutex<VecDeque<Task>>,
    schedule: Box<dyn Fn() + Send + Sync>,
}

/// Adapter turning a foreign event loop's `schedule()` hook into a FIFO queue.
///
/// The hook is invoked exactly once per empty-to-nonempty transition; the host
/// arranges for [`ExternalWorkQueue::drain`] to run later on its own loop.
/// This collapses N enqueues into O(1) host wakeups.
#[derive(Clone)]
pub struct ExternalWorkQueue {
    inner: Arc<ExternalQueueInner>,
}

impl ExternalWorkQueue {
    #[must_use]
    pub fn new<S: Fn() + Send + Sync + 'static>(schedule: S) -> Self {
        ExternalWorkQueue {
            inner: Arc::new(ExternalQueueInner {
                tasks: Mutex::new(VecDeque::new()),
                schedule: Box::new(schedule),
            }),
        }
    }

    /// Run every callback accumulated since the last `schedule()` signal.
    ///
    /// Called by the host loop. An enqueue arriving mid-drain finds the queue
    /// empty again and re-arms the hook, so nothing is ever stranded.
    pub fn drain(&self) {
        let batch: VecDeque<Task> = {
            let mut tasks = self.inner.tasks.lock();
            std::mem::take(&mut *tasks)
        };
        for task in batch {
            run_isolated("external", task);
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }
}

impl WorkQueue for ExternalWorkQueue {
    fn enqueue(&self, task: Task) {
        let was_empty = {
            let mut tasks = self.inner.tasks.lock();
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        // Hook runs outside the lock; the host may call drain() inline.
        if was_empty {
            (self.inner.schedule)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
        let start = std::time::Instant::now();
        while !done() {
            assert!(start.elapsed() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn thread_queue_runs_in_fifo_order_and_isolates_panics() {
        let queue = ThreadWorkQueue::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = Arc::clone(&order);
            queue.push(move || {
                order.lock().push(i);
                if i == 3 {
                    panic!("callback 3 exploded");
                }
            });
        }

        wait_until(Duration::from_secs(5), || order.lock().len() == 10);
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn thread_queue_drains_backlog_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let queue = ThreadWorkQueue::new("drop-test");
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                queue.push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn pool_queue_executes_everything_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let queue = ThreadPoolWorkQueue::new("pool-test", 4);
            for i in 0..50 {
                let counter = Arc::clone(&counter);
                queue.push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if i % 7 == 0 {
                        panic!("spurious failure");
                    }
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn external_queue_schedules_once_per_batch() {
        let wakeups = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&wakeups);
        let queue = ExternalWorkQueue::new(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            queue.push(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Five enqueues while non-empty: a single host wakeup.
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
        queue.drain();
        assert_eq!(ran.load(Ordering::SeqCst), 5);

        // Queue is empty again: next enqueue re-arms the hook.
        queue.push(|| {});
        assert_eq!(wakeups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn external_queue_drain_is_panic_isolated() {
        let queue = ExternalWorkQueue::new(|| {});
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let ran = Arc::clone(&ran);
            queue.push(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    panic!("first callback fails");
                }
            });
        }
        queue.drain();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending(), 0);
    }
}
