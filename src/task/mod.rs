//! Units of work scheduled on dispatcher queues.
//!
//! A [`Task`] is a one-shot closure plus the bookkeeping the runtime needs
//! to run it faithfully:
//!
//! - a captured [causality context](crate::causality) reinstalled on the
//!   executing worker thread before the body runs;
//! - an optional **finalizer**, run exactly once when the task (and, for an
//!   iterator task, its whole continuation chain) finishes or faults —
//!   arbiters use it to release interleave slots, callers use it for
//!   completion signalling;
//! - an optional **unroll** thunk, run instead of the body when the task is
//!   abandoned before execution (queue disposed, interleave torn down) so
//!   messages captured by the task can be reposted to their ports.
//!
//! A body may return a [`TaskSequence`]: an iterator of follow-up tasks.
//! The executing worker advances such a sequence one step per scheduling
//! quantum, re-enqueueing the continuation between steps, so a long-running
//! staged computation cannot starve its queue.

use crate::causality::{self, CausalitySet};

/// An iterator of follow-up tasks produced by a staged task body.
///
/// Each `next()` yields the next step; the runtime executes the step and
/// then re-enqueues the remainder of the sequence as a fresh task.
pub type TaskSequence = Box<dyn Iterator<Item = Task> + Send + 'static>;

pub(crate) type TaskBody = Box<dyn FnOnce() -> Option<TaskSequence> + Send + 'static>;
pub(crate) type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// A schedulable unit of work.
pub struct Task {
    pub(crate) body: TaskBody,
    pub(crate) finalizer: Option<Thunk>,
    pub(crate) unroll: Option<Thunk>,
    pub(crate) causality: Option<CausalitySet>,
}

impl Task {
    /// Creates a task that runs `handler` once.
    ///
    /// The current thread's causality context is captured now and
    /// reinstalled around the handler when it executes.
    #[must_use]
    pub fn new(handler: impl FnOnce() + Send + 'static) -> Self {
        Self {
            body: Box::new(move || {
                handler();
                None
            }),
            finalizer: None,
            unroll: None,
            causality: causality::capture(),
        }
    }

    /// Creates a task that runs `stage` once and then drives the sequence
    /// it returns, one step per scheduling quantum.
    #[must_use]
    pub fn staged(
        stage: impl FnOnce() -> TaskSequence + Send + 'static,
    ) -> Self {
        Self {
            body: Box::new(move || Some(stage())),
            finalizer: None,
            unroll: None,
            causality: causality::capture(),
        }
    }

    /// Builds a task straight from a body closure, without capturing the
    /// caller's causality context.
    pub(crate) fn from_body(
        body: impl FnOnce() -> Option<TaskSequence> + Send + 'static,
    ) -> Self {
        Self {
            body: Box::new(body),
            finalizer: None,
            unroll: None,
            causality: None,
        }
    }

    /// Attaches a finalizer, replacing any existing one.
    pub(crate) fn set_finalizer(&mut self, finalizer: Thunk) {
        self.finalizer = Some(finalizer);
    }

    /// Whether a finalizer is attached.
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    /// Attaches an unroll thunk, replacing any existing one.
    pub(crate) fn set_unroll(&mut self, unroll: Thunk) {
        self.unroll = Some(unroll);
    }

    pub(crate) fn set_causality(&mut self, context: Option<CausalitySet>) {
        self.causality = context;
    }

    /// Abandons the task without running its body: reposts captured
    /// messages and runs the finalizer.
    pub(crate) fn abandon(self) {
        if let Some(unroll) = self.unroll {
            unroll();
        }
        if let Some(finalizer) = self.finalizer {
            finalizer();
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("has_finalizer", &self.finalizer.is_some())
            .field("has_unroll", &self.unroll.is_some())
            .field("has_causality", &self.causality.is_some())
            .finish()
    }
}
