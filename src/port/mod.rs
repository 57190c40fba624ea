//! Typed mailboxes.
//!
//! A [`Port<T>`] is an unbounded FIFO mailbox for messages of type `T`.
//! Posting never waits on mailbox capacity, though a post whose handler
//! task lands on a throttle-constrained queue stalls in that queue's
//! admission. A port also carries the set of receiver arms
//! currently attached to it; posting offers the new element to each arm in
//! registration order, and attaching an arm first drains the backlog
//! through it, so no message can sit in a port while a willing receiver is
//! attached.
//!
//! # Delivery protocol
//!
//! Delivery passes ownership. The port detaches the element from its store
//! and hands it to an arm, which answers with an [`Offer`]:
//!
//! - [`Offer::Consumed`]: the arm took the element, possibly yielding a
//!   task to schedule (the receiver's handler bound to the message).
//! - [`Offer::Declined`]: the element comes back (a predicate rejected it,
//!   an arbiter vetoed it, or the arm only probes) and is reinstated at its
//!   original position. A declined offer may still yield a side task, e.g.
//!   a join noticing that all its ports are now non-empty.
//!
//! Tasks produced while the port lock is held are enqueued after it is
//! released; arms must never take a port lock inside `offer`.
//!
//! # Invariants
//!
//! - The logical length (`len`) counts the element being offered, so
//!   cross-port availability probes taken during delivery see it.
//! - A one-shot arm that consumes is detached before the port lock drops;
//!   it can never be offered a second element.

pub(crate) mod store;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::causality::{self, CausalitySet};
use crate::error::ArbiterError;
use crate::queue::DispatcherQueue;
use crate::task::Task;

pub(crate) use store::Element;
use store::ElementStore;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery mode of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortMode {
    /// Any number of receivers; full offer protocol.
    #[default]
    Default,
    /// Exactly one persistent, predicate-free receiver. Posts bypass the
    /// store and schedule the handler directly.
    OptimizedSingleReissueReceiver,
}

/// An arm's answer to an offered element.
pub(crate) enum Offer<T> {
    /// Element taken; optionally a task to schedule.
    Consumed(Option<Task>),
    /// Element returned; optionally a side task to schedule anyway.
    Declined(Element<T>, Option<Task>),
}

/// A receiver-side attachment point registered on a port.
///
/// Implemented by receivers, join probes, and gather buckets. `offer` is
/// called with the port lock held and must not take any port lock itself.
pub(crate) trait PortArm<T: Send>: Send + Sync {
    /// Process-unique arm id, used for detach.
    fn arm_id(&self) -> u64;

    /// Whether the arm is retired and should be pruned.
    fn is_retired(&self) -> bool;

    /// Whether the arm survives a successful consume.
    fn is_persistent(&self) -> bool;

    /// Offers ownership of an element.
    fn offer(&self, element: Element<T>) -> Offer<T>;

    /// The queue tasks from this arm should be scheduled on. `None` only
    /// before activation, when the arm cannot produce tasks yet.
    fn task_queue(&self) -> Option<DispatcherQueue>;

    /// Whether the arm supports the single-receiver consume fast path.
    fn supports_consume(&self) -> bool {
        false
    }

    /// Consume fast path: take the element and schedule the handler
    /// directly, without touching the store.
    fn consume(&self, element: Element<T>) {
        // only reachable for arms that advertise supports_consume
        if let Offer::Consumed(Some(task)) = self.offer(element) {
            if let Some(queue) = self.task_queue() {
                queue.schedule(task);
            }
        }
    }
}

struct PortState<T: Send> {
    store: ElementStore<T>,
    arms: SmallVec<[Arc<dyn PortArm<T>>; 1]>,
    mode: PortMode,
}

struct PortInner<T: Send> {
    id: u64,
    len: AtomicUsize,
    state: Mutex<PortState<T>>,
}

/// An unbounded typed mailbox.
///
/// Cloning yields another handle to the same mailbox.
pub struct Port<T: Send + 'static> {
    inner: Arc<PortInner<T>>,
}

impl<T: Send + 'static> Clone for Port<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for Port<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Scheduled = SmallVec<[(DispatcherQueue, Task); 2]>;

impl<T: Send + 'static> Port<T> {
    /// Creates an empty port.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PortInner {
                id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
                len: AtomicUsize::new(0),
                state: Mutex::new(PortState {
                    store: ElementStore::new(),
                    arms: SmallVec::new(),
                    mode: PortMode::Default,
                }),
            }),
        }
    }

    /// Process-unique port identity. Joins take elements in id order so
    /// two joins over the same ports cannot livelock each other.
    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of messages currently queued (including one mid-delivery).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Acquire)
    }

    /// Whether the port holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Switches the delivery mode. Fails if receivers are already attached
    /// in a way the new mode cannot express.
    pub fn set_mode(&self, mode: PortMode) -> Result<(), ArbiterError> {
        let mut state = self.inner.state.lock();
        if mode == PortMode::OptimizedSingleReissueReceiver
            && (state.arms.len() > 1
                || state
                    .arms
                    .first()
                    .is_some_and(|a| !a.supports_consume() || !a.is_persistent()))
        {
            return Err(ArbiterError::ReceiverLimit);
        }
        state.mode = mode;
        Ok(())
    }

    /// Posts a message, capturing the caller's causality context.
    pub fn post(&self, item: T) {
        self.post_element(Element::new(item, causality::capture()), false);
    }

    /// Posts an element, optionally at the head of the queue (used when
    /// rolling back a partial take or unrolling an abandoned task).
    pub(crate) fn post_element(&self, element: Element<T>, at_head: bool) {
        let mut scheduled: Scheduled = SmallVec::new();
        {
            let mut state = self.inner.state.lock();
            self.inner.len.fetch_add(1, Ordering::Release);

            // fast path: single reissuing receiver, nothing queued ahead
            if state.mode == PortMode::OptimizedSingleReissueReceiver
                && state.store.is_empty()
                && state.arms.len() == 1
            {
                let arm = Arc::clone(&state.arms[0]);
                drop(state);
                self.inner.len.fetch_sub(1, Ordering::Release);
                arm.consume(element);
                return;
            }

            let id = if at_head {
                state.store.push_front(element)
            } else {
                state.store.push_back(element)
            };
            if !state.arms.is_empty() {
                let successor = state.store.next_id(id);
                if let Some(element) = state.store.remove(id) {
                    self.offer_one(&mut state, element, successor, &mut scheduled);
                }
            }
        }
        dispatch(scheduled);
    }

    /// Offers a detached element to every arm in order; reinstates it at
    /// `successor` if nobody consumes. Caller holds the state lock.
    fn offer_one(
        &self,
        state: &mut PortState<T>,
        element: Element<T>,
        successor: Option<u32>,
        scheduled: &mut Scheduled,
    ) {
        let mut pending = Some(element);
        let mut idx = 0;
        while idx < state.arms.len() {
            let arm = Arc::clone(&state.arms[idx]);
            if arm.is_retired() {
                state.arms.remove(idx);
                continue;
            }
            let Some(element) = pending.take() else { break };
            match arm.offer(element) {
                Offer::Consumed(task) => {
                    self.inner.len.fetch_sub(1, Ordering::Release);
                    if let Some(task) = task {
                        if let Some(queue) = arm.task_queue() {
                            scheduled.push((queue, task));
                        }
                    }
                    if !arm.is_persistent() {
                        state.arms.remove(idx);
                    }
                    return;
                }
                Offer::Declined(element, side) => {
                    pending = Some(element);
                    if let Some(task) = side {
                        if let Some(queue) = arm.task_queue() {
                            scheduled.push((queue, task));
                        }
                    }
                    idx += 1;
                }
            }
        }
        if let Some(element) = pending {
            state.store.insert_before(successor, element);
        }
    }

    /// Attaches an arm, draining the backlog through it first.
    pub(crate) fn register_arm(&self, arm: Arc<dyn PortArm<T>>) -> Result<(), ArbiterError> {
        let mut scheduled: Scheduled = SmallVec::new();
        {
            let mut state = self.inner.state.lock();
            if arm.is_retired() {
                return Ok(());
            }
            if state.mode == PortMode::OptimizedSingleReissueReceiver
                && (!state.arms.is_empty() || !arm.supports_consume() || !arm.is_persistent())
            {
                return Err(ArbiterError::ReceiverLimit);
            }

            let mut cursor = state.store.front_id();
            let mut consumed_oneshot = false;
            while let Some(id) = cursor {
                if arm.is_retired() {
                    break;
                }
                let next = state.store.next_id(id);
                let Some(element) = state.store.remove(id) else {
                    break;
                };
                match arm.offer(element) {
                    Offer::Consumed(task) => {
                        self.inner.len.fetch_sub(1, Ordering::Release);
                        if let Some(task) = task {
                            if let Some(queue) = arm.task_queue() {
                                scheduled.push((queue, task));
                            }
                        }
                        if !arm.is_persistent() {
                            consumed_oneshot = true;
                            break;
                        }
                    }
                    Offer::Declined(element, side) => {
                        state.store.insert_before(next, element);
                        if let Some(task) = side {
                            if let Some(queue) = arm.task_queue() {
                                scheduled.push((queue, task));
                            }
                        }
                    }
                }
                cursor = next;
            }
            if !consumed_oneshot {
                state.arms.push(arm);
            }
        }
        dispatch(scheduled);
        Ok(())
    }

    /// Detaches the arm with the given id.
    pub(crate) fn unregister_arm(&self, arm_id: u64) {
        let mut state = self.inner.state.lock();
        state.arms.retain(|a| a.arm_id() != arm_id);
    }

    /// Number of attached receiver arms.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.inner.state.lock().arms.len()
    }

    /// Takes the oldest message, if any.
    #[must_use]
    pub fn try_take(&self) -> Option<T> {
        self.try_take_element().map(|e| e.item)
    }

    pub(crate) fn try_take_element(&self) -> Option<Element<T>> {
        let mut state = self.inner.state.lock();
        let element = state.store.pop_front()?;
        self.inner.len.fetch_sub(1, Ordering::Release);
        Some(element)
    }

    /// Takes the `count` oldest messages atomically: either all or none.
    #[must_use]
    pub fn try_take_multiple(&self, count: usize) -> Option<Vec<T>> {
        self.try_take_multiple_elements(count)
            .map(|els| els.into_iter().map(|e| e.item).collect())
    }

    pub(crate) fn try_take_multiple_elements(&self, count: usize) -> Option<Vec<Element<T>>> {
        let mut state = self.inner.state.lock();
        if state.store.len() < count {
            return None;
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match state.store.pop_front() {
                Some(element) => out.push(element),
                None => break,
            }
        }
        self.inner.len.fetch_sub(out.len(), Ordering::Release);
        Some(out)
    }

    /// Discards all queued messages, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.state.lock();
        let dropped = state.store.drain().len();
        self.inner.len.fetch_sub(dropped, Ordering::Release);
        dropped
    }
}

impl<T: Send + 'static> std::fmt::Debug for Port<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .finish()
    }
}

fn dispatch(scheduled: Scheduled) {
    for (queue, task) in scheduled {
        queue.schedule(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_take_fifo() {
        let port = Port::new();
        port.post(1);
        port.post(2);
        port.post(3);
        assert_eq!(port.len(), 3);
        assert_eq!(port.try_take(), Some(1));
        assert_eq!(port.try_take(), Some(2));
        assert_eq!(port.try_take(), Some(3));
        assert_eq!(port.try_take(), None);
        assert!(port.is_empty());
    }

    #[test]
    fn take_multiple_is_all_or_nothing() {
        let port = Port::new();
        port.post("a");
        port.post("b");
        assert_eq!(port.try_take_multiple(3), None);
        assert_eq!(port.len(), 2);
        assert_eq!(port.try_take_multiple(2), Some(vec!["a", "b"]));
        assert!(port.is_empty());
    }

    #[test]
    fn clear_drops_backlog() {
        let port = Port::new();
        for i in 0..5 {
            port.post(i);
        }
        assert_eq!(port.clear(), 5);
        assert!(port.is_empty());
    }

    #[test]
    fn clones_share_the_mailbox() {
        let a = Port::new();
        let b = a.clone();
        a.post(7);
        assert_eq!(b.try_take(), Some(7));
    }
}
