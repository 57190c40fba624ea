//! Worker threads: queue scanning, task execution, and fault routing.
//!
//! Each worker owns a [`WorkerSignal`]: a one-slot wake token. A worker
//! that finds nothing to run *arms* its signal and blocks on it; the
//! dispatcher wakes at most one armed worker per new task. A wake epoch on
//! the dispatcher closes the race between a worker's last scan and its
//! arming: if anything was signalled in between, the worker skips the wait
//! and rescans.
//!
//! # Execution
//!
//! Running a task reinstalls its captured causality context, catches
//! panics, and runs the finalizer exactly once when the task (or its
//! continuation chain) terminates, faults, or is abandoned. A body that
//! returns a [`TaskSequence`] is advanced one step per quantum: the step
//! runs inline, then the remainder is re-enqueued, so staged work
//! interleaves fairly with everything else on the queue. A step that
//! itself returns a sequence has that sequence chained in front of the
//! remainder.
//!
//! # Fault routing
//!
//! A panicking body is flattened to a [`Fault`](crate::error::Fault) and
//! offered, in order, to: the task's causality sinks, the queue's
//! unhandled-fault port, the dispatcher's unhandled-fault port. Only if
//! all three decline is the fault logged as unhandled.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::causality;
use crate::error::Fault;
use crate::queue::DispatcherQueue;
use crate::task::{Task, TaskSequence, Thunk};

use super::DispatcherInner;

/// Idle wait when no timers are scheduled; bounds how long a worker can
/// outlive a dropped dispatcher.
const IDLE_WAIT: Duration = Duration::from_millis(100);
/// Wait granularity while timers are pending.
const TIMER_WAIT: Duration = Duration::from_millis(1);

/// One-slot wake token of a worker thread.
pub(super) struct WorkerSignal {
    armed: AtomicBool,
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl WorkerSignal {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(false),
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Wakes the worker if it is armed. Returns whether the wake was
    /// delivered, so a signaller can stop at the first armed worker.
    pub(super) fn notify_if_armed(&self) -> bool {
        if self.armed.swap(false, Ordering::AcqRel) {
            self.force_notify();
            true
        } else {
            false
        }
    }

    /// Unconditional wake; a spurious one only costs an extra scan.
    pub(super) fn force_notify(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.condvar.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut flag = self.flag.lock();
        if !*flag {
            let _ = self.condvar.wait_for(&mut flag, timeout);
        }
        *flag = false;
        self.disarm();
    }
}

/// Worker main loop.
pub(super) fn run(dispatcher: Weak<DispatcherInner>, signal: Arc<WorkerSignal>, index: usize) {
    let mut rotation = index;
    loop {
        let Some(inner) = dispatcher.upgrade() else {
            break;
        };
        if inner.is_shutdown() {
            break;
        }

        let epoch = inner.wake_epoch();
        let queues = inner.queue_snapshot();
        let mut executed = false;
        let mut timers_pending = false;
        if !queues.is_empty() {
            let now = Instant::now();
            for i in 0..queues.len() {
                let queue = &queues[(rotation + i) % queues.len()];
                timers_pending |= queue.poll_timers(now);
                if let Ok(Some(task)) = queue.try_dequeue() {
                    executed = true;
                    execute(task, queue);
                }
            }
            rotation = rotation.wrapping_add(1);
        }

        if executed {
            continue;
        }
        signal.arm();
        if inner.wake_epoch() != epoch {
            // something was signalled during the scan
            signal.disarm();
            continue;
        }
        let timeout = if timers_pending { TIMER_WAIT } else { IDLE_WAIT };
        drop(inner);
        signal.wait(timeout);
    }
    signal.disarm();
}

/// Executes one task to its next quantum boundary.
pub(super) fn execute(task: Task, queue: &DispatcherQueue) {
    let Task {
        body,
        finalizer,
        unroll: _,
        causality: context,
    } = task;
    causality::install(context);
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(None) => finish(finalizer),
        Ok(Some(sequence)) => advance(sequence, finalizer, queue),
        Err(payload) => {
            route_fault(payload.as_ref(), queue);
            finish(finalizer);
        }
    }
    causality::clear_causalities();
}

/// Advances a continuation sequence by one step and re-enqueues the rest.
fn advance(mut sequence: TaskSequence, finalizer: Option<Thunk>, queue: &DispatcherQueue) {
    // the context to resume the iterator under next quantum
    let snapshot = causality::capture();
    match catch_unwind(AssertUnwindSafe(|| sequence.next())) {
        Err(payload) => {
            route_fault(payload.as_ref(), queue);
            finish(finalizer);
        }
        Ok(None) => finish(finalizer),
        Ok(Some(step)) => {
            let Task {
                body,
                finalizer: step_finalizer,
                unroll: _,
                causality: step_context,
            } = step;
            if step_context.is_some() {
                causality::install(step_context);
            }
            match catch_unwind(AssertUnwindSafe(body)) {
                Err(payload) => {
                    route_fault(payload.as_ref(), queue);
                    finish(step_finalizer);
                    finish(finalizer);
                }
                Ok(None) => {
                    finish(step_finalizer);
                    requeue(sequence, snapshot, finalizer, queue);
                }
                Ok(Some(nested)) => {
                    // nested stages run to completion before the outer
                    // sequence resumes
                    let chained: TaskSequence = Box::new(nested.chain(sequence));
                    requeue(chained, snapshot, combine(step_finalizer, finalizer), queue);
                }
            }
        }
    }
}

fn requeue(
    sequence: TaskSequence,
    snapshot: Option<causality::CausalitySet>,
    finalizer: Option<Thunk>,
    queue: &DispatcherQueue,
) {
    // the sequence is parked in a cell so an abandoned wrapper can still
    // unroll every step the remainder holds
    let cell = Arc::new(Mutex::new(Some(sequence)));
    let body_cell = Arc::clone(&cell);
    let mut task = Task::from_body(move || body_cell.lock().take());
    task.set_causality(snapshot);
    if let Some(finalizer) = finalizer {
        task.set_finalizer(finalizer);
    }
    task.set_unroll(Box::new(move || {
        if let Some(remainder) = cell.lock().take() {
            for step in remainder {
                step.abandon();
            }
        }
    }));
    queue.schedule(task);
}

fn finish(finalizer: Option<Thunk>) {
    if let Some(finalizer) = finalizer {
        finalizer();
    }
}

fn combine(first: Option<Thunk>, second: Option<Thunk>) -> Option<Thunk> {
    match (first, second) {
        (None, None) => None,
        (Some(f), None) => Some(f),
        (None, Some(s)) => Some(s),
        (Some(f), Some(s)) => Some(Box::new(move || {
            f();
            s();
        })),
    }
}

fn route_fault(payload: &(dyn std::any::Any + Send), queue: &DispatcherQueue) {
    let fault = Fault::from_panic(payload);
    if causality::route_fault(&fault) {
        tracing::debug!(queue = %queue.name(), %fault, "fault routed to causality sink");
        return;
    }
    if queue.raise_unhandled(fault.clone()) {
        tracing::debug!(queue = %queue.name(), %fault, "fault routed to queue port");
        return;
    }
    if queue.dispatcher().raise_unhandled(fault.clone()) {
        tracing::debug!(queue = %queue.name(), %fault, "fault routed to dispatcher port");
        return;
    }
    tracing::error!(queue = %queue.name(), %fault, "unhandled task fault");
}
