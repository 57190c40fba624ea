//! Dispatcher queues: FIFO task queues with admission policies and timers.
//!
//! A [`DispatcherQueue`] is the unit of scheduling fairness: every task
//! produced by a receiver runs on the queue its branch was activated on,
//! and a dispatcher's workers round-robin across the queues registered
//! with it. A queue is created against a dispatcher and registered under a
//! unique name; disposing it unregisters it.
//!
//! # Admission policies
//!
//! Enqueue behaviour is governed by a [`TaskExecutionPolicy`]:
//!
//! - `Unconstrained`: plain unbounded FIFO.
//! - depth-constrained: when the backlog is at the bound, either the
//!   **oldest** task is discarded to make room (discard flavour) or the
//!   enqueueing thread sleeps until the backlog drains (throttle flavour).
//! - rate-constrained: identical pair keyed on the average scheduling rate
//!   (tasks per second since the queue was created) instead of the depth.
//!
//! Policy engagements are observable: discarded tasks and throttle stalls
//! are posted to an optional notification port.
//!
//! # Suspension and timers
//!
//! A suspended queue keeps accepting tasks but yields none until resumed.
//! Timers are per-queue: [`DispatcherQueue::enqueue_timer`] posts the
//! deadline to a port when it passes, under the causality context captured
//! at scheduling time. Timers fire even while the queue is suspended only
//! after resume, since workers poll timers and task slots together.

pub(crate) mod timer;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::causality;
use crate::dispatcher::Dispatcher;
use crate::error::{Fault, QueueError};
use crate::port::Port;
use crate::task::Task;

use timer::{TimerEntry, TimerTable};

/// Admission policy of a dispatcher queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskExecutionPolicy {
    /// Unbounded FIFO.
    Unconstrained,
    /// Discard the oldest task when the backlog reaches `maximum_depth`.
    ConstrainQueueDepthDiscardTasks {
        /// Largest backlog admitted without engaging the policy.
        maximum_depth: usize,
    },
    /// Block the enqueueing thread while the backlog is at `maximum_depth`.
    ConstrainQueueDepthThrottleExecution {
        /// Largest backlog admitted without engaging the policy.
        maximum_depth: usize,
    },
    /// Discard the oldest task when the average scheduling rate reaches
    /// `maximum_rate` tasks per second.
    ConstrainSchedulingRateDiscardTasks {
        /// Largest average rate admitted without engaging the policy.
        maximum_rate: f64,
    },
    /// Block the enqueueing thread while the average scheduling rate is at
    /// or above `maximum_rate` tasks per second.
    ConstrainSchedulingRateThrottleExecution {
        /// Largest average rate admitted without engaging the policy.
        maximum_rate: f64,
    },
}

impl TaskExecutionPolicy {
    fn validate(&self) -> Result<(), QueueError> {
        match *self {
            Self::Unconstrained => Ok(()),
            Self::ConstrainQueueDepthDiscardTasks { maximum_depth }
            | Self::ConstrainQueueDepthThrottleExecution { maximum_depth } => {
                if maximum_depth == 0 {
                    Err(QueueError::InvalidDepth)
                } else {
                    Ok(())
                }
            }
            Self::ConstrainSchedulingRateDiscardTasks { maximum_rate }
            | Self::ConstrainSchedulingRateThrottleExecution { maximum_rate } => {
                if maximum_rate > 0.0 {
                    Ok(())
                } else {
                    Err(QueueError::InvalidRate)
                }
            }
        }
    }
}

/// Observable policy engagement, posted to the queue's notification port.
pub enum PolicyNotification {
    /// A task was discarded to stay within the policy bound.
    Discarded(Task),
    /// An enqueueing thread was stalled by a throttle policy.
    Throttled,
}

impl std::fmt::Debug for PolicyNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discarded(_) => f.write_str("Discarded"),
            Self::Throttled => f.write_str("Throttled"),
        }
    }
}

const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(10);

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

struct QueueState {
    tasks: VecDeque<Task>,
    suspended: bool,
    disposed: bool,
    /// Tasks admitted since creation, for the rate policies.
    scheduled_items: f64,
}

struct QueueInner {
    id: u64,
    name: String,
    dispatcher: Dispatcher,
    policy: TaskExecutionPolicy,
    throttle_interval: Mutex<Duration>,
    created: Instant,
    state: Mutex<QueueState>,
    timers: TimerTable,
    notification_port: Mutex<Option<Port<PolicyNotification>>>,
    unhandled_fault_port: Mutex<Option<Port<Fault>>>,
    scheduled_count: AtomicU64,
}

/// A named FIFO task queue bound to a dispatcher.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct DispatcherQueue {
    inner: Arc<QueueInner>,
}

impl DispatcherQueue {
    /// Creates an unconstrained queue registered with `dispatcher`.
    pub fn new(name: impl Into<String>, dispatcher: &Dispatcher) -> Result<Self, QueueError> {
        Self::with_policy(name, dispatcher, TaskExecutionPolicy::Unconstrained)
    }

    /// Creates a queue with an explicit admission policy.
    pub fn with_policy(
        name: impl Into<String>,
        dispatcher: &Dispatcher,
        policy: TaskExecutionPolicy,
    ) -> Result<Self, QueueError> {
        policy.validate()?;
        let queue = Self {
            inner: Arc::new(QueueInner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                dispatcher: dispatcher.clone(),
                policy,
                throttle_interval: Mutex::new(DEFAULT_THROTTLE_INTERVAL),
                created: Instant::now(),
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    suspended: false,
                    disposed: false,
                    scheduled_items: 0.0,
                }),
                timers: TimerTable::new(),
                notification_port: Mutex::new(None),
                unhandled_fault_port: Mutex::new(None),
                scheduled_count: AtomicU64::new(0),
            }),
        };
        dispatcher.add_queue(&queue)?;
        Ok(queue)
    }

    /// The queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn queue_id(&self) -> u64 {
        self.inner.id
    }

    /// The dispatcher this queue is bound to.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The admission policy.
    #[must_use]
    pub fn policy(&self) -> TaskExecutionPolicy {
        self.inner.policy
    }

    /// Number of tasks currently waiting.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Total tasks admitted since creation.
    #[must_use]
    pub fn scheduled_task_count(&self) -> u64 {
        self.inner.scheduled_count.load(Ordering::Acquire)
    }

    /// Average admitted tasks per second since creation.
    #[must_use]
    pub fn current_scheduling_rate(&self) -> f64 {
        let state = self.inner.state.lock();
        rate(state.scheduled_items, self.inner.created)
    }

    /// Whether the queue has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Whether the queue is suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    /// How long a throttled enqueue sleeps between backlog re-checks.
    pub fn set_throttle_interval(&self, interval: Duration) {
        *self.inner.throttle_interval.lock() = interval;
    }

    /// Routes policy engagements (discards, throttle stalls) to `port`.
    pub fn set_policy_notification_port(&self, port: Port<PolicyNotification>) {
        *self.inner.notification_port.lock() = Some(port);
    }

    /// Routes faults that no causality claimed to `port`.
    pub fn set_unhandled_fault_port(&self, port: Port<Fault>) {
        *self.inner.unhandled_fault_port.lock() = Some(port);
    }

    /// Posts a fault to this queue's unhandled-fault port, if set.
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

    /// Admits a task. Returns `Ok(true)` if admitted without engaging the
    /// policy, `Ok(false)` if the policy discarded a task to make room (or
    /// the queue is disposed and dispose errors are suppressed).
    ///
    /// Throttle policies block the calling thread until the bound clears.
    pub fn enqueue(&self, task: Task) -> Result<bool, QueueError> {
        let mut notification: Option<PolicyNotification> = None;
        let mut discarded = false;
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                drop(state);
                return self.reject_disposed(task);
            }
            match self.inner.policy {
                TaskExecutionPolicy::Unconstrained => state.tasks.push_back(task),
                TaskExecutionPolicy::ConstrainQueueDepthDiscardTasks { maximum_depth } => {
                    if state.tasks.len() >= maximum_depth {
                        if let Some(oldest) = state.tasks.pop_front() {
                            tracing::debug!(
                                queue = %self.inner.name,
                                depth = maximum_depth,
                                "depth policy engaged; discarding oldest task"
                            );
                            notification = Some(PolicyNotification::Discarded(oldest));
                            discarded = true;
                        }
                    }
                    state.tasks.push_back(task);
                }
                TaskExecutionPolicy::ConstrainQueueDepthThrottleExecution { maximum_depth } => {
                    let throttled = self.stall_while(&mut state, |s| {
                        s.tasks.len() >= maximum_depth && !s.disposed
                    });
                    if state.disposed {
                        drop(state);
                        return self.reject_disposed(task);
                    }
                    if throttled {
                        notification = Some(PolicyNotification::Throttled);
                    }
                    state.tasks.push_back(task);
                }
                TaskExecutionPolicy::ConstrainSchedulingRateDiscardTasks { maximum_rate } => {
                    if rate(state.scheduled_items, self.inner.created) >= maximum_rate {
                        if let Some(oldest) = state.tasks.pop_front() {
                            tracing::debug!(
                                queue = %self.inner.name,
                                rate = maximum_rate,
                                "rate policy engaged; discarding oldest task"
                            );
                            notification = Some(PolicyNotification::Discarded(oldest));
                            discarded = true;
                        }
                    }
                    state.scheduled_items += 1.0;
                    state.tasks.push_back(task);
                }
                TaskExecutionPolicy::ConstrainSchedulingRateThrottleExecution {
                    maximum_rate,
                } => {
                    let created = self.inner.created;
                    let throttled = self.stall_while(&mut state, |s| {
                        rate(s.scheduled_items, created) >= maximum_rate && !s.disposed
                    });
                    if state.disposed {
                        drop(state);
                        return self.reject_disposed(task);
                    }
                    if throttled {
                        notification = Some(PolicyNotification::Throttled);
                    }
                    state.scheduled_items += 1.0;
                    state.tasks.push_back(task);
                }
            }
        }
        self.inner.scheduled_count.fetch_add(1, Ordering::Release);
        self.inner.dispatcher.signal();
        if discarded {
            // the discarded task was counted as pending when admitted
            self.inner.dispatcher.adjust_pending(-1);
        }
        if let Some(notification) = notification {
            self.notify(notification);
        }
        Ok(!discarded)
    }

    /// Best-effort enqueue used by runtime internals: a rejected task is
    /// abandoned (unrolled and finalized) and the error only logged.
    pub(crate) fn schedule(&self, task: Task) {
        if let Err(err) = self.enqueue(task) {
            tracing::debug!(queue = %self.inner.name, %err, "task rejected");
        }
    }

    /// Sleeps, lock released, until `stalled` stops holding. Returns
    /// whether it ever held.
    fn stall_while(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        stalled: impl Fn(&QueueState) -> bool,
    ) -> bool {
        let mut engaged = false;
        while stalled(state) {
            if !engaged {
                engaged = true;
                tracing::debug!(queue = %self.inner.name, "throttle engaged");
            }
            let interval = *self.inner.throttle_interval.lock();
            MutexGuard::unlocked(state, || std::thread::sleep(interval));
        }
        engaged
    }

    fn notify(&self, notification: PolicyNotification) {
        let port = self.inner.notification_port.lock().clone();
        match (port, notification) {
            (Some(port), notification) => port.post(notification),
            // nobody listening; a discarded task is abandoned
            (None, PolicyNotification::Discarded(task)) => task.abandon(),
            (None, PolicyNotification::Throttled) => {}
        }
    }

    fn reject_disposed(&self, task: Task) -> Result<bool, QueueError> {
        task.abandon();
        if self
            .inner
            .dispatcher
            .options()
            .suppress_dispose_exceptions
        {
            tracing::debug!(queue = %self.inner.name, "enqueue on disposed queue suppressed");
            Ok(false)
        } else {
            Err(QueueError::Disposed(self.inner.name.clone()))
        }
    }

    /// Takes the next runnable task, honouring suspension.
    pub(crate) fn try_dequeue(&self) -> Result<Option<Task>, QueueError> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            drop(state);
            if self
                .inner
                .dispatcher
                .options()
                .suppress_dispose_exceptions
            {
                return Ok(None);
            }
            return Err(QueueError::Disposed(self.inner.name.clone()));
        }
        if state.suspended {
            return Ok(None);
        }
        match state.tasks.pop_front() {
            Some(task) => {
                drop(state);
                self.inner.dispatcher.adjust_pending(-1);
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Stops yielding tasks until [`resume`](Self::resume). Idempotent.
    pub fn suspend(&self) {
        let mut state = self.inner.state.lock();
        if state.disposed || state.suspended {
            return;
        }
        state.suspended = true;
        drop(state);
        self.inner.dispatcher.queue_suspended(true);
    }

    /// Resumes a suspended queue. Idempotent.
    pub fn resume(&self) {
        let mut state = self.inner.state.lock();
        if !state.suspended {
            return;
        }
        state.suspended = false;
        drop(state);
        self.inner.dispatcher.queue_suspended(false);
        self.inner.dispatcher.wake_all();
    }

    /// Posts `port` the deadline instant once `delay` has elapsed. The
    /// caller's causality context is captured and reinstalled around the
    /// post.
    pub fn enqueue_timer(&self, delay: Duration, port: &Port<Instant>) {
        let deadline = Instant::now() + delay;
        let became_earliest = self.inner.timers.schedule(
            deadline,
            TimerEntry {
                port: port.clone(),
                causality: causality::capture(),
            },
        );
        if became_earliest {
            // shorten sleeping workers' waits
            self.inner.dispatcher.wake_all();
        }
    }

    /// Fires due timers. Returns whether any timers remain scheduled.
    pub(crate) fn poll_timers(&self, now: Instant) -> bool {
        {
            let state = self.inner.state.lock();
            if state.disposed || state.suspended {
                return false;
            }
        }
        let due = self.inner.timers.take_due(now);
        if !due.is_empty() {
            timer::fire(due, now);
        }
        self.inner.timers.has_pending()
    }

    /// Disposes the queue: drops queued tasks (abandoning them), clears
    /// timers, and unregisters from the dispatcher. Idempotent.
    pub fn dispose(&self) {
        let (dropped, was_suspended) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let was_suspended = std::mem::replace(&mut state.suspended, false);
            let dropped: Vec<Task> = state.tasks.drain(..).collect();
            (dropped, was_suspended)
        };
        let pending = dropped.len();
        for task in dropped {
            task.abandon();
        }
        self.inner.timers.clear();
        if was_suspended {
            self.inner.dispatcher.queue_suspended(false);
        }
        if self.inner.dispatcher.remove_queue(self.inner.id) {
            self.inner.dispatcher.adjust_pending(-(pending as i64));
        }
        tracing::debug!(queue = %self.inner.name, dropped = pending, "queue disposed");
    }
}

impl std::fmt::Debug for DispatcherQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherQueue")
            .field("name", &self.inner.name)
            .field("count", &self.count())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

fn rate(scheduled_items: f64, created: Instant) -> f64 {
    let elapsed = created.elapsed().as_secs_f64();
    if elapsed <= f64::EPSILON {
        return 0.0;
    }
    scheduled_items / elapsed
}
