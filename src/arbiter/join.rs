//! Joins: fire once messages are available on every constituent port.
//!
//! A join attaches a lightweight probe to each of its ports. Probes never
//! consume during delivery; they only watch availability and, when every
//! port reports at least its required count, schedule a commit task. The
//! commit re-checks availability and performs a **two-phase take**: ports
//! are drained one element at a time in port-identity order, and if any
//! port comes up empty (a competing receiver got there first) everything
//! taken so far is reposted at the head of its port, position intact.
//! Either the handler sees a complete set or the ports are untouched.
//!
//! Taking in identity order means two joins over the same ports contend in
//! the same order and one of them completes; opposite orders could unroll
//! each other forever.
//!
//! The handler task carries the merged causality contexts of every taken
//! message.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::arbiter::{Arbiter, ArbiterState, Arm, Branch, BranchContext};
use crate::causality::{self, CausalitySet};
use crate::error::ArbiterError;
use crate::port::{Element, Offer, Port, PortArm};
use crate::queue::DispatcherQueue;
use crate::receiver::next_arm_id;
use crate::task::Task;

/// Availability and take strategy of a concrete join shape.
pub(crate) trait JoinPlan: Send + Sync + 'static {
    /// A complete taken set, elements with their causality contexts.
    type Output: Send + 'static;

    /// Whether every port currently reports enough elements.
    fn ready(&self) -> bool;

    /// Two-phase take: all elements or none.
    fn take(&self) -> Option<Self::Output>;

    /// Reposts a taken set at the head of its ports.
    fn unroll(&self, output: Self::Output);

    /// Merged causality context of a taken set.
    fn causality_of(output: &Self::Output) -> Option<CausalitySet>;

    /// Attaches probes to every port.
    fn register(&self, driver: Arc<dyn JoinDriver>) -> Result<(), ArbiterError>;

    /// Detaches all probes.
    fn unregister(&self);
}

/// Erased view of a join used by its port probes.
pub(crate) trait JoinDriver: Send + Sync {
    fn retired(&self) -> bool;
    fn should_commit(&self) -> bool;
    fn make_commit_task(self: Arc<Self>) -> Task;
    fn task_queue(&self) -> Option<DispatcherQueue>;
}

/// Port-side probe: declines every element, raising a commit task when the
/// join becomes ready.
struct JoinProbe<T: Send + 'static> {
    id: u64,
    driver: Arc<dyn JoinDriver>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> PortArm<T> for JoinProbe<T> {
    fn arm_id(&self) -> u64 {
        self.id
    }

    fn is_retired(&self) -> bool {
        self.driver.retired()
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn offer(&self, element: Element<T>) -> Offer<T> {
        let side = if self.driver.should_commit() {
            Some(Arc::clone(&self.driver).make_commit_task())
        } else {
            None
        };
        Offer::Declined(element, side)
    }

    fn task_queue(&self) -> Option<DispatcherQueue> {
        self.driver.task_queue()
    }
}

fn attach_probe<T: Send + 'static>(
    port: &Port<T>,
    slot: &OnceLock<u64>,
    driver: &Arc<dyn JoinDriver>,
) -> Result<(), ArbiterError> {
    let id = next_arm_id();
    let _ = slot.set(id);
    port.register_arm(Arc::new(JoinProbe::<T> {
        id,
        driver: Arc::clone(driver),
        _marker: PhantomData,
    }))
}

fn detach_probe<T: Send + 'static>(port: &Port<T>, slot: &OnceLock<u64>) {
    if let Some(id) = slot.get() {
        port.unregister_arm(*id);
    }
}

/// A join over a concrete plan.
pub(crate) struct Join<P: JoinPlan> {
    persistent: bool,
    retired: AtomicBool,
    commit_gate: AtomicU32,
    plan: P,
    handler: Arc<dyn Fn(P::Output) + Send + Sync>,
    queue: OnceLock<DispatcherQueue>,
    arbiter: Mutex<Option<Arc<dyn Arbiter>>>,
    context: Arc<BranchContext>,
}

impl<P: JoinPlan> Join<P> {
    fn new(
        persistent: bool,
        plan: P,
        handler: impl Fn(P::Output) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            persistent,
            retired: AtomicBool::new(false),
            commit_gate: AtomicU32::new(0),
            plan,
            handler: Arc::new(handler),
            queue: OnceLock::new(),
            arbiter: Mutex::new(None),
            context: BranchContext::new(persistent),
        })
    }

    fn retire_self(&self) {
        self.retired.store(true, Ordering::Release);
        self.plan.unregister();
        *self.arbiter.lock() = None;
    }

    fn make_handler_task(&self, output: P::Output) -> Task {
        let causality = P::causality_of(&output);
        let handler = Arc::clone(&self.handler);
        let mut task = Task::from_body(move || {
            handler(output);
            None
        });
        task.set_causality(causality);
        task
    }

    /// Handler task whose taken set can still be recovered; the unroll
    /// thunk reposts it if the task is abandoned.
    #[allow(clippy::type_complexity)]
    fn make_recoverable_task(
        self: &Arc<Self>,
        output: P::Output,
    ) -> (Task, Arc<Mutex<Option<P::Output>>>) {
        let causality = P::causality_of(&output);
        let cell = Arc::new(Mutex::new(Some(output)));
        let handler = Arc::clone(&self.handler);
        let body_cell = Arc::clone(&cell);
        let mut task = Task::from_body(move || {
            let output = body_cell.lock().take()?;
            handler(output);
            None
        });
        task.set_causality(causality);
        let join = Arc::clone(self);
        let unroll_cell = Arc::clone(&cell);
        task.set_unroll(Box::new(move || {
            if let Some(output) = unroll_cell.lock().take() {
                join.plan.unroll(output);
            }
        }));
        (task, cell)
    }

    fn commit(self: &Arc<Self>) {
        if !self.should_commit() {
            return;
        }
        let Some(output) = self.plan.take() else {
            return;
        };
        if !self.persistent && self.commit_gate.fetch_add(1, Ordering::AcqRel) > 0 {
            // another commit task won the race after we took the set
            self.plan.unroll(output);
            return;
        }
        let arbiter = self.arbiter.lock().clone();
        match arbiter {
            None => {
                if !self.persistent {
                    self.retire_self();
                }
                let task = self.make_handler_task(output);
                if let Some(queue) = self.queue.get() {
                    queue.schedule(task);
                }
            }
            Some(arbiter) => {
                let (task, cell) = self.make_recoverable_task(output);
                let mut slot = Some(task);
                if arbiter.evaluate(&self.context, &mut slot) {
                    if !self.persistent {
                        self.retire_self();
                    }
                    if let Some(task) = slot.take() {
                        if let Some(queue) = self.queue.get() {
                            queue.schedule(task);
                        }
                    }
                } else {
                    if let Some(output) = cell.lock().take() {
                        self.plan.unroll(output);
                    }
                    // the set went back; allow a later attempt
                    self.commit_gate.store(0, Ordering::Release);
                }
            }
        }
    }
}

impl<P: JoinPlan> JoinDriver for Join<P> {
    fn retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn should_commit(&self) -> bool {
        if self.retired() {
            return false;
        }
        if self
            .arbiter
            .lock()
            .as_ref()
            .is_some_and(|a| a.state() == ArbiterState::Done)
        {
            return false;
        }
        self.plan.ready()
    }

    fn make_commit_task(self: Arc<Self>) -> Task {
        Task::from_body(move || {
            self.commit();
            None
        })
    }

    fn task_queue(&self) -> Option<DispatcherQueue> {
        self.queue.get().cloned()
    }
}

impl<P: JoinPlan> Arm for Join<P> {
    fn attach(
        self: Arc<Self>,
        queue: &DispatcherQueue,
        arbiter: Option<Arc<dyn Arbiter>>,
    ) -> Result<(), ArbiterError> {
        self.queue
            .set(queue.clone())
            .map_err(|_| ArbiterError::AlreadyActivated)?;
        *self.arbiter.lock() = arbiter;
        // drain any pre-existing complete sets before probes go live
        self.commit();
        if self.retired() {
            return Ok(());
        }
        self.plan
            .register(Arc::clone(&self) as Arc<dyn JoinDriver>)
    }

    fn retire(&self) {
        self.retire_self();
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn branch_context(&self) -> Arc<BranchContext> {
        Arc::clone(&self.context)
    }
}

/// Join over two differently typed ports.
struct Join2<A: Send + 'static, B: Send + 'static> {
    a: Port<A>,
    b: Port<B>,
    a_first: bool,
    probe_a: OnceLock<u64>,
    probe_b: OnceLock<u64>,
}

impl<A: Send + 'static, B: Send + 'static> JoinPlan for Join2<A, B> {
    type Output = (Element<A>, Element<B>);

    fn ready(&self) -> bool {
        !self.a.is_empty() && !self.b.is_empty()
    }

    fn take(&self) -> Option<Self::Output> {
        if self.a_first {
            let ea = self.a.try_take_element()?;
            match self.b.try_take_element() {
                Some(eb) => Some((ea, eb)),
                None => {
                    self.a.post_element(ea, true);
                    None
                }
            }
        } else {
            let eb = self.b.try_take_element()?;
            match self.a.try_take_element() {
                Some(ea) => Some((ea, eb)),
                None => {
                    self.b.post_element(eb, true);
                    None
                }
            }
        }
    }

    fn unroll(&self, (ea, eb): Self::Output) {
        self.a.post_element(ea, true);
        self.b.post_element(eb, true);
    }

    fn causality_of((ea, eb): &Self::Output) -> Option<CausalitySet> {
        causality::merge_all([ea.causality.as_ref(), eb.causality.as_ref()])
    }

    fn register(&self, driver: Arc<dyn JoinDriver>) -> Result<(), ArbiterError> {
        if self.a_first {
            attach_probe(&self.a, &self.probe_a, &driver)?;
            attach_probe(&self.b, &self.probe_b, &driver)
        } else {
            attach_probe(&self.b, &self.probe_b, &driver)?;
            attach_probe(&self.a, &self.probe_a, &driver)
        }
    }

    fn unregister(&self) {
        detach_probe(&self.a, &self.probe_a);
        detach_probe(&self.b, &self.probe_b);
    }
}

/// Join over a list of same-typed ports.
struct JoinVec<T: Send + 'static> {
    ports: Vec<Port<T>>,
    /// Indices into `ports`, sorted by port identity: the take order.
    take_order: Vec<usize>,
    probes: Vec<OnceLock<u64>>,
}

impl<T: Send + 'static> JoinPlan for JoinVec<T> {
    type Output = Vec<Element<T>>;

    fn ready(&self) -> bool {
        self.ports.iter().all(|p| !p.is_empty())
    }

    fn take(&self) -> Option<Self::Output> {
        let mut taken: Vec<Option<Element<T>>> = Vec::new();
        taken.resize_with(self.ports.len(), || None);
        for &idx in &self.take_order {
            match self.ports[idx].try_take_element() {
                Some(element) => taken[idx] = Some(element),
                None => {
                    for (idx, element) in taken.into_iter().enumerate() {
                        if let Some(element) = element {
                            self.ports[idx].post_element(element, true);
                        }
                    }
                    return None;
                }
            }
        }
        // every slot filled at this point
        Some(taken.into_iter().flatten().collect())
    }

    fn unroll(&self, output: Self::Output) {
        for (port, element) in self.ports.iter().zip(output) {
            port.post_element(element, true);
        }
    }

    fn causality_of(output: &Self::Output) -> Option<CausalitySet> {
        causality::merge_all(output.iter().map(|e| e.causality.as_ref()))
    }

    fn register(&self, driver: Arc<dyn JoinDriver>) -> Result<(), ArbiterError> {
        for &idx in &self.take_order {
            attach_probe(&self.ports[idx], &self.probes[idx], &driver)?;
        }
        Ok(())
    }

    fn unregister(&self) {
        for (port, probe) in self.ports.iter().zip(&self.probes) {
            detach_probe(port, probe);
        }
    }
}

/// Join over `count` items of a single port.
struct JoinSinglePort<T: Send + 'static> {
    port: Port<T>,
    count: usize,
    probe: OnceLock<u64>,
}

impl<T: Send + 'static> JoinPlan for JoinSinglePort<T> {
    type Output = Vec<Element<T>>;

    fn ready(&self) -> bool {
        self.port.len() >= self.count
    }

    fn take(&self) -> Option<Self::Output> {
        self.port.try_take_multiple_elements(self.count)
    }

    fn unroll(&self, output: Self::Output) {
        // repost innermost-first so the original order is restored
        for element in output.into_iter().rev() {
            self.port.post_element(element, true);
        }
    }

    fn causality_of(output: &Self::Output) -> Option<CausalitySet> {
        causality::merge_all(output.iter().map(|e| e.causality.as_ref()))
    }

    fn register(&self, driver: Arc<dyn JoinDriver>) -> Result<(), ArbiterError> {
        attach_probe(&self.port, &self.probe, &driver)
    }

    fn unregister(&self) {
        detach_probe(&self.port, &self.probe);
    }
}

/// Creates a join branch over two ports: `handler` runs with one message
/// from each once both are available.
#[must_use]
pub fn joined_receive<A: Send + 'static, B: Send + 'static>(
    persistent: bool,
    port_a: &Port<A>,
    port_b: &Port<B>,
    handler: impl Fn(A, B) + Send + Sync + 'static,
) -> Branch {
    let plan = Join2 {
        a: port_a.clone(),
        b: port_b.clone(),
        a_first: port_a.id() <= port_b.id(),
        probe_a: OnceLock::new(),
        probe_b: OnceLock::new(),
    };
    Branch {
        arm: Join::new(persistent, plan, move |(ea, eb): (Element<A>, Element<B>)| {
            handler(ea.item, eb.item);
        }),
    }
}

/// Creates a join branch over a list of ports: `handler` runs with one
/// message from each, in the order the ports were given.
pub fn multiple_port_receive<T: Send + 'static>(
    persistent: bool,
    ports: &[Port<T>],
    handler: impl Fn(Vec<T>) + Send + Sync + 'static,
) -> Result<Branch, ArbiterError> {
    if ports.is_empty() {
        return Err(ArbiterError::EmptyJoin);
    }
    let mut take_order: Vec<usize> = (0..ports.len()).collect();
    take_order.sort_by_key(|&idx| ports[idx].id());
    let plan = JoinVec {
        ports: ports.to_vec(),
        take_order,
        probes: (0..ports.len()).map(|_| OnceLock::new()).collect(),
    };
    Ok(Branch {
        arm: Join::new(persistent, plan, move |elements: Vec<Element<T>>| {
            handler(elements.into_iter().map(|e| e.item).collect());
        }),
    })
}

/// Creates a join branch over `count` messages of a single port.
pub fn multiple_item_receive<T: Send + 'static>(
    persistent: bool,
    port: &Port<T>,
    count: usize,
    handler: impl Fn(Vec<T>) + Send + Sync + 'static,
) -> Result<Branch, ArbiterError> {
    if count == 0 {
        return Err(ArbiterError::InvalidItemCount);
    }
    let plan = JoinSinglePort {
        port: port.clone(),
        count,
        probe: OnceLock::new(),
    };
    Ok(Branch {
        arm: Join::new(persistent, plan, move |elements: Vec<Element<T>>| {
            handler(elements.into_iter().map(|e| e.item).collect());
        }),
    })
}
