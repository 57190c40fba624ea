//! Causality contexts: named exception-routing scopes that travel with
//! messages.
//!
//! A [`Causality`] is a named scope with an optional exception-sink port.
//! The set of active causalities is thread-local state: it is captured into
//! every message posted and every task created on that thread, and
//! reinstalled on whichever worker thread later executes the resulting
//! handler. When a handler panics, the fault is delivered to the sink ports
//! of the active causalities instead of crashing the worker.
//!
//! # Design
//!
//! A thread's context is either a single linear chain of causalities (the
//! common case, kept allocation-light) or, after a join merges messages
//! that arrived under different contexts, a set of independent stacks.
//! Faults are routed to the innermost causality of each stack that carries
//! a sink port.
//!
//! Causality identity is a process-local monotonically increasing `u64`;
//! two clones of the same causality compare equal by id, which is what the
//! merge dedup relies on.
//!
//! # Invariants
//!
//! - Capturing a context never aliases mutable state: captures are deep
//!   clones of the (cheap, `Arc`-backed) causality handles.
//! - Merging is idempotent: merging a context into itself, or merging the
//!   same stack twice, changes nothing.
//! - Fault routing consumes one level: delivering a fault pops the
//!   innermost sink so a fault loop cannot ping-pong forever.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Fault;
use crate::port::Port;

static NEXT_CAUSALITY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<CausalitySet>> = const { RefCell::new(None) };
}

/// A named exception-routing scope.
///
/// Cloning a causality yields a handle to the same scope: clones share the
/// same identity and the same sink port.
#[derive(Clone)]
pub struct Causality {
    name: Arc<str>,
    id: u64,
    exception_port: Option<Port<Fault>>,
}

impl Causality {
    /// Creates a causality with no exception sink. Faults raised under it
    /// fall through to the queue and dispatcher fault ports.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            id: NEXT_CAUSALITY_ID.fetch_add(1, Ordering::Relaxed),
            exception_port: None,
        }
    }

    /// Creates a causality whose faults are posted to `exception_port`.
    #[must_use]
    pub fn with_exception_port(name: impl Into<Arc<str>>, exception_port: Port<Fault>) -> Self {
        Self {
            name: name.into(),
            id: NEXT_CAUSALITY_ID.fetch_add(1, Ordering::Relaxed),
            exception_port: Some(exception_port),
        }
    }

    /// The scope name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The process-unique scope id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn sink(&self) -> Option<&Port<Fault>> {
        self.exception_port.as_ref()
    }
}

impl std::fmt::Debug for Causality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Causality")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("has_sink", &self.exception_port.is_some())
            .finish()
    }
}

/// A captured set of causality stacks.
///
/// `active` is the single-chain fast path; once contexts from differently
/// scoped messages merge, the set degrades to explicit stacks (innermost
/// causality last).
#[derive(Clone, Default)]
pub(crate) struct CausalitySet {
    active: Option<Causality>,
    stacks: Vec<Vec<Causality>>,
}

impl CausalitySet {
    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_none() && self.stacks.is_empty()
    }

    /// Pushes a causality as the new innermost scope of every stack.
    fn add(&mut self, causality: Causality) {
        if self.is_empty() {
            self.active = Some(causality);
            return;
        }
        if let Some(active) = self.active.take() {
            if active.id == causality.id {
                self.active = Some(active);
                return;
            }
            self.stacks.push(vec![active, causality]);
            return;
        }
        for stack in &mut self.stacks {
            if !stack.iter().any(|c| c.id == causality.id) {
                stack.push(causality.clone());
            }
        }
    }

    /// Removes the named causality wherever it appears. Returns whether
    /// anything was removed.
    fn remove_by_name(&mut self, name: &str) -> bool {
        let mut removed = false;
        if self
            .active
            .as_ref()
            .is_some_and(|c| c.name.as_ref() == name)
        {
            self.active = None;
            removed = true;
        }
        for stack in &mut self.stacks {
            let before = stack.len();
            stack.retain(|c| c.name.as_ref() != name);
            removed |= stack.len() != before;
        }
        self.normalize();
        removed
    }

    /// The innermost causality of each stack.
    fn heads(&self) -> Vec<Causality> {
        if let Some(active) = &self.active {
            return vec![active.clone()];
        }
        self.stacks
            .iter()
            .filter_map(|s| s.last().cloned())
            .collect()
    }

    /// Merges another captured context into this one, deduplicating stacks
    /// that share the same innermost causality.
    pub(crate) fn merge(&mut self, other: &Self) {
        for stack in other.as_stacks() {
            let head = match stack.last() {
                Some(head) => head.id,
                None => continue,
            };
            let duplicate = match &self.active {
                Some(active) => active.id == head,
                None => self
                    .stacks
                    .iter()
                    .any(|s| s.last().is_some_and(|c| c.id == head)),
            };
            if duplicate {
                continue;
            }
            if let Some(active) = self.active.take() {
                self.stacks.push(vec![active]);
            }
            self.stacks.push(stack);
        }
        self.normalize();
    }

    fn as_stacks(&self) -> Vec<Vec<Causality>> {
        if let Some(active) = &self.active {
            return vec![vec![active.clone()]];
        }
        self.stacks.clone()
    }

    /// Collapses a single one-element stack back into the fast path and
    /// drops empty stacks.
    fn normalize(&mut self) {
        self.stacks.retain(|s| !s.is_empty());
        if self.active.is_none() && self.stacks.len() == 1 && self.stacks[0].len() == 1 {
            self.active = self.stacks.pop().and_then(|mut s| s.pop());
        }
    }

    /// Delivers `fault` to the innermost sink of each stack, popping one
    /// level per stack. Returns whether at least one sink accepted it.
    pub(crate) fn flush_fault(&mut self, fault: &Fault) -> bool {
        let mut delivered = false;
        if let Some(active) = self.active.take() {
            if let Some(sink) = active.sink() {
                sink.post(fault.clone());
                delivered = true;
            }
            // sink or not, the scope is consumed
            return delivered;
        }
        for stack in &mut self.stacks {
            if let Some(inner) = stack.pop() {
                if let Some(sink) = inner.sink() {
                    sink.post(fault.clone());
                    delivered = true;
                }
            }
        }
        self.normalize();
        delivered
    }
}

impl std::fmt::Debug for CausalitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalitySet")
            .field("stacks", &self.as_stacks())
            .finish()
    }
}

/// Adds `causality` to the current thread's active context. Messages posted
/// and tasks created afterwards on this thread carry it.
pub fn add_causality(causality: Causality) {
    CURRENT.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(CausalitySet::default)
            .add(causality);
    });
}

/// Removes the named causality from the current thread's context. Returns
/// whether anything was removed.
pub fn remove_causality(name: &str) -> bool {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let removed = slot
            .as_mut()
            .is_some_and(|set| set.remove_by_name(name));
        if slot.as_ref().is_some_and(CausalitySet::is_empty) {
            *slot = None;
        }
        removed
    })
}

/// The innermost causality of each active stack on this thread.
#[must_use]
pub fn active_causalities() -> Vec<Causality> {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(CausalitySet::heads)
            .unwrap_or_default()
    })
}

/// Whether any causality is active on this thread.
#[must_use]
pub fn has_active_causalities() -> bool {
    CURRENT.with(|cell| cell.borrow().as_ref().is_some_and(|s| !s.is_empty()))
}

/// Clears the current thread's causality context.
pub fn clear_causalities() {
    CURRENT.with(|cell| *cell.borrow_mut() = None);
}

/// Captures the current thread's context, if any.
pub(crate) fn capture() -> Option<CausalitySet> {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .filter(|set| !set.is_empty())
            .cloned()
    })
}

/// Installs a captured context on the current thread, replacing whatever
/// was there.
pub(crate) fn install(context: Option<CausalitySet>) {
    CURRENT.with(|cell| *cell.borrow_mut() = context);
}

/// Merges the contexts of several joined messages into one capture.
pub(crate) fn merge_all<'a>(
    contexts: impl IntoIterator<Item = Option<&'a CausalitySet>>,
) -> Option<CausalitySet> {
    let mut merged: Option<CausalitySet> = None;
    for context in contexts.into_iter().flatten() {
        match &mut merged {
            None => merged = Some(context.clone()),
            Some(m) => m.merge(context),
        }
    }
    merged.filter(|m| !m.is_empty())
}

/// Routes a fault through the current thread's context. Returns whether a
/// sink accepted it.
///
/// The set is taken out of the thread-local first: posting to a sink port
/// re-enters [`capture`], which must not find the cell borrowed. The
/// remaining levels are reinstalled afterwards.
pub(crate) fn route_fault(fault: &Fault) -> bool {
    let taken = CURRENT.with(|cell| cell.borrow_mut().take());
    let Some(mut set) = taken else {
        return false;
    };
    let delivered = set.flush_fault(fault);
    if !set.is_empty() {
        CURRENT.with(|cell| *cell.borrow_mut() = Some(set));
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(names: &[&str]) -> CausalitySet {
        let mut set = CausalitySet::default();
        for n in names {
            set.add(Causality::new(*n));
        }
        set
    }

    #[test]
    fn add_and_remove_roundtrip() {
        clear_causalities();
        add_causality(Causality::new("outer"));
        add_causality(Causality::new("inner"));
        assert!(has_active_causalities());
        let heads = active_causalities();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].name(), "inner");
        assert!(remove_causality("inner"));
        assert!(!remove_causality("inner"));
        assert!(remove_causality("outer"));
        assert!(!has_active_causalities());
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let c = Causality::new("dup");
        let mut set = CausalitySet::default();
        set.add(c.clone());
        set.add(c);
        assert_eq!(set.heads().len(), 1);
    }

    #[test]
    fn merge_dedups_by_identity() {
        let c = Causality::new("shared");
        let mut a = CausalitySet::default();
        a.add(c.clone());
        let mut b = CausalitySet::default();
        b.add(c);
        a.merge(&b);
        assert_eq!(a.heads().len(), 1);
    }

    #[test]
    fn merge_keeps_distinct_stacks() {
        let mut a = set_of(&["left"]);
        let b = set_of(&["right"]);
        a.merge(&b);
        let mut names: Vec<String> =
            a.heads().iter().map(|c| c.name().to_owned()).collect();
        names.sort();
        assert_eq!(names, ["left", "right"]);
    }

    #[test]
    fn flush_routes_to_sink_and_pops() {
        let sink = Port::new();
        let mut set = CausalitySet::default();
        set.add(Causality::with_exception_port("scoped", sink.clone()));
        assert!(set.flush_fault(&Fault::new("oops")));
        let fault = sink.try_take().expect("fault delivered");
        assert_eq!(fault.message(), "oops");
        assert!(set.is_empty());
        assert!(!set.flush_fault(&Fault::new("again")));
    }

    #[test]
    fn route_fault_delivers_while_the_context_is_installed() {
        clear_causalities();
        let sink = Port::new();
        add_causality(Causality::with_exception_port("scoped", sink.clone()));
        // delivery posts to the sink, which re-reads the thread-local
        assert!(route_fault(&Fault::new("boom")));
        let fault = sink.try_take().expect("fault delivered");
        assert_eq!(fault.message(), "boom");
        assert!(!has_active_causalities());
        assert!(!route_fault(&Fault::new("again")));
    }

    #[test]
    fn flush_without_sink_consumes_scope() {
        let mut set = set_of(&["plain"]);
        assert!(!set.flush_fault(&Fault::new("oops")));
        assert!(set.is_empty());
    }
}
