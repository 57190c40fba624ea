//! The dispatcher: a fixed pool of worker threads driving a set of queues.
//!
//! A [`Dispatcher`] spawns its workers up front and never grows or shrinks
//! the pool. Workers scan the dispatcher's queues round-robin, each
//! starting from a different offset so they spread across queues, and
//! sleep on per-worker signals when idle. Posting work wakes at most one
//! sleeping worker.
//!
//! Queues register themselves on construction (names are unique per
//! dispatcher) and unregister on disposal; when the last registered queue
//! is removed the dispatcher disposes itself. Disposal is idempotent,
//! stops the workers, and joins them (except a worker disposing its own
//! dispatcher, which is not joined from itself).

mod worker;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::error::{Fault, QueueError};
use crate::port::Port;
use crate::queue::DispatcherQueue;

use worker::WorkerSignal;

/// Behavioural switches of a dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    /// Swallow operations on disposed queues instead of returning
    /// [`QueueError::Disposed`].
    pub suppress_dispose_exceptions: bool,
    /// Workers per core when the thread count is left at zero.
    pub threads_per_core: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            suppress_dispose_exceptions: false,
            threads_per_core: 1,
        }
    }
}

pub(crate) struct DispatcherInner {
    name: String,
    options: DispatcherOptions,
    worker_count: usize,
    queues: RwLock<Vec<DispatcherQueue>>,
    /// Tasks admitted but not yet dequeued, across all queues.
    pending: AtomicI64,
    suspended_queues: AtomicUsize,
    /// Bumped on every wake; lets workers close the scan/arm race.
    epoch: AtomicU64,
    signals: RwLock<Vec<Arc<WorkerSignal>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
    disposed: AtomicBool,
    /// Whether a queue was ever registered; gates auto-dispose.
    had_queues: AtomicBool,
    unhandled_fault_port: Mutex<Option<Port<Fault>>>,
}

impl DispatcherInner {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn wake_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn queue_snapshot(&self) -> Vec<DispatcherQueue> {
        self.queues.read().clone()
    }

    fn signal(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for signal in self.signals.read().iter() {
            if signal.notify_if_armed() {
                return;
            }
        }
    }

    fn wake_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for signal in self.signals.read().iter() {
            signal.force_notify();
        }
    }
}

/// A fixed pool of worker threads.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Creates a dispatcher with `thread_count` workers; zero means one
    /// worker per core (at least two), scaled by
    /// [`DispatcherOptions::threads_per_core`].
    #[must_use]
    pub fn new(thread_count: usize, name: impl Into<String>) -> Self {
        Self::with_options(thread_count, name, DispatcherOptions::default())
    }

    /// Creates a dispatcher with explicit options.
    #[must_use]
    pub fn with_options(
        thread_count: usize,
        name: impl Into<String>,
        options: DispatcherOptions,
    ) -> Self {
        let name = name.into();
        let worker_count = if thread_count == 0 {
            let cores = std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(2)
                .max(2);
            cores * options.threads_per_core.max(1)
        } else {
            thread_count
        };

        let inner = Arc::new(DispatcherInner {
            name: name.clone(),
            options,
            worker_count,
            queues: RwLock::new(Vec::new()),
            pending: AtomicI64::new(0),
            suspended_queues: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            signals: RwLock::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            had_queues: AtomicBool::new(false),
            unhandled_fault_port: Mutex::new(None),
        });

        {
            let mut signals = inner.signals.write();
            let mut handles = inner.handles.lock();
            for index in 0..worker_count {
                let signal = WorkerSignal::new();
                signals.push(Arc::clone(&signal));
                let weak: Weak<DispatcherInner> = Arc::downgrade(&inner);
                let spawned = std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || worker::run(weak, signal, index));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        tracing::error!(dispatcher = %name, %err, "failed to spawn worker")
                    }
                }
            }
        }
        Self { inner }
    }

    /// The dispatcher name, used as a worker thread name prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_thread_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Tasks admitted across all queues but not yet picked up.
    #[must_use]
    pub fn pending_task_count(&self) -> i64 {
        self.inner.pending.load(Ordering::Acquire).max(0)
    }

    /// The dispatcher options.
    #[must_use]
    pub fn options(&self) -> DispatcherOptions {
        self.inner.options
    }

    /// Names of the registered queues.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.inner
            .queues
            .read()
            .iter()
            .map(|q| q.name().to_owned())
            .collect()
    }

    /// Routes faults that neither a causality nor a queue claimed.
    pub fn set_unhandled_fault_port(&self, port: Port<Fault>) {
        *self.inner.unhandled_fault_port.lock() = Some(port);
    }

    pub(crate) fn raise_unhandled(&self, fault: Fault) -> bool {
        let port = self.inner.unhandled_fault_port.lock().clone();
        match port {
            Some(port) => {
                port.post(fault);
                true
            }
            None => false,
        }
    }

    pub(crate) fn add_queue(&self, queue: &DispatcherQueue) -> Result<(), QueueError> {
        let mut queues = self.inner.queues.write();
        if queues.iter().any(|q| q.name() == queue.name()) {
            return Err(QueueError::DuplicateName(queue.name().to_owned()));
        }
        queues.push(queue.clone());
        self.inner.had_queues.store(true, Ordering::Release);
        Ok(())
    }

    /// Unregisters a queue. Returns whether it was registered. Removing
    /// the last queue disposes the dispatcher.
    pub(crate) fn remove_queue(&self, queue_id: u64) -> bool {
        let (removed, now_empty) = {
            let mut queues = self.inner.queues.write();
            let before = queues.len();
            queues.retain(|q| q.queue_id() != queue_id);
            (queues.len() != before, queues.is_empty())
        };
        if removed && now_empty && self.inner.had_queues.load(Ordering::Acquire) {
            self.dispose();
        }
        removed
    }

    pub(crate) fn signal(&self) {
        self.inner.signal();
    }

    pub(crate) fn wake_all(&self) {
        self.inner.wake_all();
    }

    pub(crate) fn adjust_pending(&self, delta: i64) {
        self.inner.pending.fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn queue_suspended(&self, suspended: bool) {
        if suspended {
            self.inner.suspended_queues.fetch_add(1, Ordering::AcqRel);
        } else {
            self.inner.suspended_queues.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Stops the workers and joins them. Queues still registered are
    /// disposed first (their backlogs are abandoned). Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in self.inner.queue_snapshot() {
            queue.dispose();
        }
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake_all();
        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        tracing::debug!(dispatcher = %self.inner.name, "dispatcher disposed");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.worker_count)
            .field("pending", &self.pending_task_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sizing_is_at_least_two_workers() {
        let dispatcher = Dispatcher::new(0, "sizing");
        assert!(dispatcher.worker_thread_count() >= 2);
        dispatcher.dispose();
    }

    #[test]
    fn duplicate_queue_names_are_rejected() {
        let dispatcher = Dispatcher::new(1, "dup");
        let _a = DispatcherQueue::new("q", &dispatcher).expect("first registration");
        let b = DispatcherQueue::new("q", &dispatcher);
        assert!(matches!(b, Err(QueueError::DuplicateName(_))));
        dispatcher.dispose();
    }

    #[test]
    fn dispose_is_idempotent() {
        let dispatcher = Dispatcher::new(1, "twice");
        dispatcher.dispose();
        dispatcher.dispose();
    }
}
