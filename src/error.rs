//! Error types for the conflux runtime.
//!
//! The error surface is deliberately small and front-loaded:
//!
//! - **Arbitration errors** ([`ArbiterError`]): misuse detected while an
//!   arbiter or receiver is being built (a persistent branch in a choice,
//!   a join over zero ports, ...). These surface at construction or
//!   activation time, never during message delivery.
//! - **Capacity errors** ([`QueueError::InvalidDepth`] /
//!   [`QueueError::InvalidRate`]): non-positive bounds for a constrained
//!   queue, also construction-time.
//! - **Disposal errors** ([`QueueError::Disposed`]): operations against a
//!   disposed queue. Whether these are returned or silently swallowed is
//!   governed by [`DispatcherOptions`](crate::dispatcher::DispatcherOptions).
//! - **Task faults** ([`Fault`]): a panic raised from a task body. Panics
//!   never take down a worker thread; they are flattened to a `Fault` and
//!   routed through the causality chain (see [`causality`](crate::causality)).
//!
//! Host-fatal conditions (out of memory, stack overflow) abort the process
//! rather than unwinding, so they never reach this module.

use std::any::Any;
use std::fmt;

/// Construction-time arbitration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ArbiterError {
    /// A choice was given a persistent branch; a branch that never
    /// exhausts would keep the choice unresolved forever.
    #[error("choice branches cannot be persistent")]
    PersistentChoiceBranch,

    /// A choice was given no branches.
    #[error("choice requires at least one branch")]
    EmptyChoice,

    /// A join was given no ports.
    #[error("join requires at least one port")]
    EmptyJoin,

    /// A multiple-item receive was given a zero item count.
    #[error("item count must be at least one")]
    InvalidItemCount,

    /// An interleave concurrent-group branch was one-shot; concurrent
    /// branches must reissue after each firing.
    #[error("concurrent interleave branches must be persistent")]
    OneShotConcurrentBranch,

    /// An interleave teardown-group branch was persistent; a teardown
    /// branch that reissues can never retire the arbiter.
    #[error("teardown interleave branches cannot be persistent")]
    PersistentTeardownBranch,

    /// A receiver or join was activated twice.
    #[error("receiver is already activated")]
    AlreadyActivated,

    /// A port in single-reissue-receiver mode was asked to accept a second
    /// receiver, or a receiver that cannot use the consume fast path.
    #[error("optimized ports allow only a single persistent receiver")]
    ReceiverLimit,

    /// [`execute_to_completion`](crate::outcome::execute_to_completion) was
    /// handed a task that already carries a finalizer.
    #[error("task already has a finalizer attached")]
    TaskAlreadyHasFinalizer,
}

/// Queue construction and admission errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum QueueError {
    /// A depth-constrained policy was given a zero maximum depth.
    #[error("maximum queue depth must be at least one")]
    InvalidDepth,

    /// A rate-constrained policy was given a non-positive maximum rate.
    #[error("maximum scheduling rate must be positive")]
    InvalidRate,

    /// The queue has been disposed.
    #[error("queue `{0}` is disposed")]
    Disposed(String),

    /// A queue with the same name is already registered with the dispatcher.
    #[error("queue name `{0}` is already registered")]
    DuplicateName(String),
}

/// A routed task failure.
///
/// Produced when a task body panics. The payload is flattened to a message
/// so the fault can be cloned across causality stacks and posted to
/// exception-sink ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    message: String,
}

impl Fault {
    /// Creates a fault with an explicit message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Flattens a panic payload into a fault.
    #[must_use]
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_owned()
        };
        Self { message }
    }

    /// The fault message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Fault {}
