//! Receivers: the bridge from a port's delivery protocol to handler tasks.
//!
//! A [`Receiver`] binds a handler to a port, optionally guarded by a
//! predicate and/or an arbiter. It implements the port-side
//! [`PortArm`](crate::port::PortArm) protocol: for each offered element it
//! decides match/no-match, builds the handler task, and consults its
//! arbiter before committing.
//!
//! # Recoverable tasks
//!
//! When an arbiter is involved, the element cannot simply be moved into
//! the handler closure: a veto must hand it back, and an interleave
//! teardown must be able to repost it even after the task was built. The
//! receiver therefore parks the element in a shared cell; the task body
//! takes it from the cell at execution time, a veto recovers it from the
//! cell, and the task's unroll thunk reposts it at the head of its port.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::arbiter::{Arbiter, Arm, BranchContext};
use crate::error::ArbiterError;
use crate::port::{Element, Offer, Port, PortArm};
use crate::queue::DispatcherQueue;
use crate::task::{Task, TaskSequence};

static NEXT_ARM_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_arm_id() -> u64 {
    NEXT_ARM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Built but not yet attached to a queue.
    Created,
    /// Attached and accepting messages.
    Active,
    /// Fired (one-shot) or torn down; ignores further offers.
    Retired,
}

const STATE_CREATED: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_RETIRED: u8 = 2;

enum Handler<T> {
    Plain(Arc<dyn Fn(T) + Send + Sync>),
    Staged(Arc<dyn Fn(T) -> TaskSequence + Send + Sync>),
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(h) => Self::Plain(Arc::clone(h)),
            Self::Staged(h) => Self::Staged(Arc::clone(h)),
        }
    }
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A handler bound to a port.
pub struct Receiver<T: Send + 'static> {
    id: u64,
    state: AtomicU8,
    persistent: bool,
    port: Port<T>,
    predicate: Option<Predicate<T>>,
    handler: Handler<T>,
    queue: OnceLock<DispatcherQueue>,
    arbiter: Mutex<Option<Arc<dyn Arbiter>>>,
    context: Arc<BranchContext>,
}

impl<T: Send + 'static> Receiver<T> {
    pub(crate) fn new(
        persistent: bool,
        port: Port<T>,
        predicate: Option<Predicate<T>>,
        handler: impl Fn(T) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_arm_id(),
            state: AtomicU8::new(STATE_CREATED),
            persistent,
            port,
            predicate,
            handler: Handler::Plain(Arc::new(handler)),
            queue: OnceLock::new(),
            arbiter: Mutex::new(None),
            context: BranchContext::new(persistent),
        })
    }

    pub(crate) fn new_staged(
        persistent: bool,
        port: Port<T>,
        handler: impl Fn(T) -> TaskSequence + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_arm_id(),
            state: AtomicU8::new(STATE_CREATED),
            persistent,
            port,
            predicate: None,
            handler: Handler::Staged(Arc::new(handler)),
            queue: OnceLock::new(),
            arbiter: Mutex::new(None),
            context: BranchContext::new(persistent),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReceiverState {
        match self.state.load(Ordering::Acquire) {
            STATE_CREATED => ReceiverState::Created,
            STATE_ACTIVE => ReceiverState::Active,
            _ => ReceiverState::Retired,
        }
    }

    fn mark_retired(&self) {
        self.state.store(STATE_RETIRED, Ordering::Release);
    }

    /// Builds the handler task for an element moved straight in. Used on
    /// the unguarded path where no veto can occur.
    fn make_task(&self, element: Element<T>) -> Task {
        let handler = self.handler.clone();
        let causality = element.causality;
        let item = element.item;
        let mut task = Task::from_body(move || match handler {
            Handler::Plain(h) => {
                h(item);
                None
            }
            Handler::Staged(h) => Some(h(item)),
        });
        task.set_causality(causality);
        task
    }

    /// Builds a handler task whose element can still be recovered: the
    /// element is parked in a cell the task body drains at run time.
    /// Returns the task and the cell.
    #[allow(clippy::type_complexity)]
    fn make_recoverable_task(
        &self,
        element: Element<T>,
    ) -> (Task, Arc<Mutex<Option<Element<T>>>>) {
        let causality = element.causality.clone();
        let cell = Arc::new(Mutex::new(Some(element)));
        let handler = self.handler.clone();
        let body_cell = Arc::clone(&cell);
        let mut task = Task::from_body(move || {
            let element = body_cell.lock().take()?;
            match handler {
                Handler::Plain(h) => {
                    h(element.item);
                    None
                }
                Handler::Staged(h) => Some(h(element.item)),
            }
        });
        task.set_causality(causality);
        let unroll_cell = Arc::clone(&cell);
        let port = self.port.clone();
        task.set_unroll(Box::new(move || {
            if let Some(element) = unroll_cell.lock().take() {
                port.post_element(element, true);
            }
        }));
        (task, cell)
    }

    fn matches(&self, item: &T) -> Option<bool> {
        let predicate = self.predicate.as_ref()?;
        match catch_unwind(AssertUnwindSafe(|| predicate(item))) {
            Ok(verdict) => Some(verdict),
            Err(_) => {
                tracing::warn!("receiver predicate panicked; message left in port");
                Some(false)
            }
        }
    }
}

impl<T: Send + 'static> PortArm<T> for Receiver<T> {
    fn arm_id(&self) -> u64 {
        self.id
    }

    fn is_retired(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RETIRED
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn offer(&self, element: Element<T>) -> Offer<T> {
        if self.is_retired() {
            return Offer::Declined(element, None);
        }
        if self.matches(&element.item) == Some(false) {
            return Offer::Declined(element, None);
        }
        let arbiter = self.arbiter.lock().clone();
        match arbiter {
            None => {
                if !self.persistent {
                    self.mark_retired();
                }
                Offer::Consumed(Some(self.make_task(element)))
            }
            Some(arbiter) => {
                let (task, cell) = self.make_recoverable_task(element);
                let mut slot = Some(task);
                if arbiter.evaluate(&self.context, &mut slot) {
                    if !self.persistent {
                        self.mark_retired();
                    }
                    Offer::Consumed(slot.take())
                } else {
                    match cell.lock().take() {
                        Some(element) => Offer::Declined(element, slot.take()),
                        // arbiter kept the element despite the veto
                        None => Offer::Consumed(slot.take()),
                    }
                }
            }
        }
    }

    fn task_queue(&self) -> Option<DispatcherQueue> {
        self.queue.get().cloned()
    }

    fn supports_consume(&self) -> bool {
        self.persistent && self.predicate.is_none() && self.arbiter.lock().is_none()
    }
}

impl<T: Send + 'static> Arm for Receiver<T> {
    fn attach(
        self: Arc<Self>,
        queue: &DispatcherQueue,
        arbiter: Option<Arc<dyn Arbiter>>,
    ) -> Result<(), ArbiterError> {
        match self.state.compare_exchange(
            STATE_CREATED,
            STATE_ACTIVE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            // a sibling resolved the arbiter before this branch attached
            Err(STATE_RETIRED) => return Ok(()),
            Err(_) => return Err(ArbiterError::AlreadyActivated),
        }
        *self.arbiter.lock() = arbiter;
        self.queue
            .set(queue.clone())
            .map_err(|_| ArbiterError::AlreadyActivated)?;
        let port = self.port.clone();
        port.register_arm(self)
    }

    fn retire(&self) {
        self.mark_retired();
        *self.arbiter.lock() = None;
        self.port.unregister_arm(self.id);
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn branch_context(&self) -> Arc<BranchContext> {
        Arc::clone(&self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unguarded_offer_consumes_and_retires_oneshot() {
        let port: Port<i32> = Port::new();
        let receiver = Receiver::new(false, port.clone(), None, |_| {});
        let offer = receiver.offer(Element::new(1, None));
        assert!(matches!(offer, Offer::Consumed(Some(_))));
        assert!(PortArm::is_retired(receiver.as_ref()));
        // retired receivers decline
        let offer = receiver.offer(Element::new(2, None));
        assert!(matches!(offer, Offer::Declined(_, None)));
    }

    #[test]
    fn predicate_rejection_declines() {
        let port: Port<i32> = Port::new();
        let receiver = Receiver::new(
            true,
            port.clone(),
            Some(Box::new(|v: &i32| *v % 2 == 0)),
            |_| {},
        );
        assert!(matches!(
            receiver.offer(Element::new(1, None)),
            Offer::Declined(_, None)
        ));
        assert!(matches!(
            receiver.offer(Element::new(2, None)),
            Offer::Consumed(Some(_))
        ));
        assert!(!PortArm::is_retired(receiver.as_ref()));
    }

    #[test]
    fn panicking_predicate_leaves_message() {
        let port: Port<i32> = Port::new();
        let receiver = Receiver::new(
            true,
            port.clone(),
            Some(Box::new(|_: &i32| panic!("bad predicate"))),
            |_| {},
        );
        assert!(matches!(
            receiver.offer(Element::new(1, None)),
            Offer::Declined(_, None)
        ));
    }
}
