//! Coordination primitives built over ports and receivers.
//!
//! An arbiter owns a set of receiver branches and decides, message by
//! message, whether a branch that matched may actually run. The veto
//! happens inside the port's delivery protocol: when a guarded receiver
//! matches an element it builds the handler task and asks its arbiter to
//! [`evaluate`](Arbiter::evaluate) it. The arbiter either accepts (and may
//! rewrite or defer the task) or vetoes, in which case the element is
//! reinstated in the port as if never seen.
//!
//! The concrete arbiters:
//!
//! - [`Choice`](choice::Choice): first branch to fire wins, siblings are
//!   retired atomically.
//! - joins ([`joined_receive`](join::joined_receive) and friends): fire
//!   once messages are available on every constituent port, taken
//!   all-or-nothing.
//! - [`Interleave`](interleave::Interleave): reader-writer scheduling
//!   across branch groups with teardown.
//! - gather ([`gather2`](gather::gather2) / [`gather3`](gather::gather3)):
//!   collect a fixed total across heterogeneous ports.
//!
//! Arbiters nest: a join or a choice branch can live inside an interleave
//! group, with the outer arbiter consulted after the inner one commits.

pub mod choice;
pub mod gather;
pub mod interleave;
pub mod join;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ArbiterError;
use crate::port::Port;
use crate::queue::DispatcherQueue;
use crate::receiver::Receiver;
use crate::task::{Task, TaskSequence};

/// Lifecycle of an arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    /// Built but not yet activated.
    Created,
    /// Accepting commits.
    Active,
    /// Resolved or torn down; all future evaluations are vetoed.
    Done,
}

/// Interleave group membership of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterleaveGroup {
    Teardown,
    Exclusive,
    Concurrent,
}

/// Per-branch state shared between a receiver and its arbiter.
///
/// The pending queue buffers handler tasks an interleave could not grant a
/// slot to; they are replayed round-robin as slots free up.
pub(crate) struct BranchContext {
    persistent: bool,
    group: Mutex<Option<InterleaveGroup>>,
    pending: Mutex<VecDeque<Task>>,
}

impl BranchContext {
    pub(crate) fn new(persistent: bool) -> Arc<Self> {
        Arc::new(Self {
            persistent,
            group: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) fn group(&self) -> Option<InterleaveGroup> {
        *self.group.lock()
    }

    pub(crate) fn set_group(&self, group: InterleaveGroup) {
        *self.group.lock() = Some(group);
    }

    pub(crate) fn push_pending(&self, task: Task) {
        self.pending.lock().push_back(task);
    }

    pub(crate) fn pop_pending(&self) -> Option<Task> {
        self.pending.lock().pop_front()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub(crate) fn drain_pending(&self) -> Vec<Task> {
        self.pending.lock().drain(..).collect()
    }
}

/// Decision surface consulted by guarded receivers during delivery.
///
/// `evaluate` is called with the port lock held; implementations must not
/// take port locks. `slot` holds the candidate handler task: an arbiter
/// may steal it (defer, stash, rewrap) by `take`-ing it. Returning `false`
/// vetoes the delivery and the element is reinstated.
pub(crate) trait Arbiter: Send + Sync {
    fn evaluate(&self, branch: &BranchContext, slot: &mut Option<Task>) -> bool;
    fn state(&self) -> ArbiterState;
}

/// Activation surface of a branch: a receiver, join, or gather that can be
/// attached to a queue, optionally under an arbiter.
pub(crate) trait Arm: Send + Sync {
    /// Registers the branch with its ports and records the queue its tasks
    /// run on. Called exactly once.
    fn attach(
        self: Arc<Self>,
        queue: &DispatcherQueue,
        arbiter: Option<Arc<dyn Arbiter>>,
    ) -> Result<(), ArbiterError>;

    /// Retires the branch: detaches it from its ports and drops its
    /// arbiter reference. Idempotent.
    fn retire(&self);

    /// Whether the branch reissues after firing.
    fn is_persistent(&self) -> bool;

    /// The branch's shared context.
    fn branch_context(&self) -> Arc<BranchContext>;
}

/// An unactivated coordination branch.
///
/// Built by [`receive`] and the join constructors; consumed by
/// [`activate`], [`choice::Choice::activate`], or an
/// [`interleave`](interleave::Interleave) group.
pub struct Branch {
    pub(crate) arm: Arc<dyn Arm>,
}

impl Branch {
    /// Whether the branch reissues after firing.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.arm.is_persistent()
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

/// Creates a receiver branch: `handler` runs on `queue` for each matching
/// message. A one-shot branch (`persistent == false`) fires at most once.
#[must_use]
pub fn receive<T: Send + 'static>(
    persistent: bool,
    port: &Port<T>,
    handler: impl Fn(T) + Send + Sync + 'static,
) -> Branch {
    Branch {
        arm: Receiver::new(persistent, port.clone(), None, handler),
    }
}

/// Creates a receiver branch guarded by a predicate. Messages failing the
/// predicate stay in the port for other receivers.
#[must_use]
pub fn receive_filtered<T: Send + 'static>(
    persistent: bool,
    port: &Port<T>,
    predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    handler: impl Fn(T) + Send + Sync + 'static,
) -> Branch {
    Branch {
        arm: Receiver::new(persistent, port.clone(), Some(Box::new(predicate)), handler),
    }
}

/// Creates a receiver branch whose handler yields a staged continuation:
/// the returned [`TaskSequence`] is driven one step per scheduling quantum.
#[must_use]
pub fn receive_staged<T: Send + 'static>(
    persistent: bool,
    port: &Port<T>,
    handler: impl Fn(T) -> TaskSequence + Send + Sync + 'static,
) -> Branch {
    Branch {
        arm: Receiver::new_staged(persistent, port.clone(), handler),
    }
}

/// Activates standalone branches on `queue`: each is registered with its
/// ports with no arbiter above it.
pub fn activate(
    queue: &DispatcherQueue,
    branches: impl IntoIterator<Item = Branch>,
) -> Result<(), ArbiterError> {
    for branch in branches {
        branch.arm.attach(queue, None)?;
    }
    Ok(())
}
