//! Completion reporting: success/failure port pairs and run-to-completion.
//!
//! The conventional way for a staged operation to report its outcome is a
//! [`SuccessFailurePort`]: a pair of ports, one carrying a [`Complete`]
//! marker and one carrying a [`Fault`]. The requesting side attaches a
//! choice over the pair, so exactly one of the two continuations runs.

use crate::arbiter::choice::Choice;
use crate::arbiter::receive;
use crate::error::{ArbiterError, Fault};
use crate::port::Port;
use crate::queue::DispatcherQueue;
use crate::task::Task;

/// Marker message signalling successful completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Complete;

/// A success/failure outcome pair.
#[derive(Clone, Default)]
pub struct SuccessFailurePort {
    success: Port<Complete>,
    failure: Port<Fault>,
}

impl SuccessFailurePort {
    /// Creates an empty outcome pair.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports success.
    pub fn post_success(&self) {
        self.success.post(Complete);
    }

    /// Reports failure.
    pub fn post_fault(&self, fault: Fault) {
        self.failure.post(fault);
    }

    /// The success side.
    #[must_use]
    pub fn success_port(&self) -> &Port<Complete> {
        &self.success
    }

    /// The failure side.
    #[must_use]
    pub fn failure_port(&self) -> &Port<Fault> {
        &self.failure
    }

    /// Activates a choice over the pair: exactly one of the handlers runs,
    /// on the first outcome posted.
    pub fn choice(
        &self,
        queue: &DispatcherQueue,
        on_success: impl Fn(Complete) + Send + Sync + 'static,
        on_failure: impl Fn(Fault) + Send + Sync + 'static,
    ) -> Result<(), ArbiterError> {
        Choice::activate(
            queue,
            vec![
                receive(false, &self.success, on_success),
                receive(false, &self.failure, on_failure),
            ],
        )
    }
}

impl std::fmt::Debug for SuccessFailurePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuccessFailurePort")
            .field("success", &self.success.len())
            .field("failure", &self.failure.len())
            .finish()
    }
}

/// Schedules `task` on `queue` and returns a port that receives
/// [`Complete`] once the task, including any continuation chain it
/// produces, has finished.
///
/// Fails if the task already carries a finalizer, since completion
/// signalling is implemented as one.
pub fn execute_to_completion(
    queue: &DispatcherQueue,
    mut task: Task,
) -> Result<Port<Complete>, ArbiterError> {
    if task.has_finalizer() {
        return Err(ArbiterError::TaskAlreadyHasFinalizer);
    }
    let done: Port<Complete> = Port::new();
    let completion = done.clone();
    task.set_finalizer(Box::new(move || {
        completion.post(Complete);
    }));
    queue.schedule(task);
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_pair_routes_posts() {
        let outcome = SuccessFailurePort::new();
        outcome.post_success();
        assert_eq!(outcome.success_port().try_take(), Some(Complete));
        outcome.post_fault(Fault::new("nope"));
        let fault = outcome.failure_port().try_take().expect("fault");
        assert_eq!(fault.message(), "nope");
    }

    #[test]
    fn completion_requires_a_free_finalizer_slot() {
        let dispatcher = crate::dispatcher::Dispatcher::new(1, "outcome-test");
        let queue = DispatcherQueue::new("q", &dispatcher).expect("queue");
        let mut task = Task::new(|| {});
        task.set_finalizer(Box::new(|| {}));
        assert!(matches!(
            execute_to_completion(&queue, task),
            Err(ArbiterError::TaskAlreadyHasFinalizer)
        ));
        dispatcher.dispose();
    }
}
