//! Gather: collect a fixed total of messages across heterogeneous ports.
//!
//! A gather attaches a bucket to each of its ports and counts admissions
//! with a single shared countdown. Every arriving message that finds the
//! countdown positive is moved into its port's bucket; the message that
//! drives the countdown to zero schedules the completion task, which hands
//! each bucket's contents to the handler in port order. Messages arriving
//! after the countdown is exhausted stay in their ports.
//!
//! The completion handler runs exactly once, with the merged causality
//! context of everything gathered. Cancelling an incomplete gather reposts
//! the gathered messages to the heads of their ports.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::causality::CausalitySet;
use crate::error::ArbiterError;
use crate::port::{Element, Offer, Port, PortArm};
use crate::queue::DispatcherQueue;
use crate::receiver::next_arm_id;
use crate::task::Task;

type Completion = Box<dyn FnOnce() + Send>;
type Thunk = Box<dyn Fn() + Send + Sync>;

struct GatherCore {
    pending: AtomicI64,
    retired: AtomicBool,
    queue: DispatcherQueue,
    /// Runs the user handler over the drained buckets. Taken exactly once.
    completion: Mutex<Option<Completion>>,
    /// Merged causality of every admitted message.
    merged: Mutex<Option<CausalitySet>>,
    /// Repost every bucket's contents to its port.
    unrollers: Mutex<Vec<Thunk>>,
    /// Detach every bucket from its port.
    detachers: Mutex<Vec<Thunk>>,
}

impl GatherCore {
    /// Detaches the buckets and drops the bucket-capturing closures; the
    /// buckets own the core, so the lists must not outlive retirement.
    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        for detach in self.detachers.lock().drain(..) {
            detach();
        }
        self.unrollers.lock().clear();
    }

    fn completion_task(self: &Arc<Self>) -> Task {
        let core = Arc::clone(self);
        let causality = core.merged.lock().clone();
        let mut task = Task::from_body(move || {
            core.retire();
            if let Some(run) = core.completion.lock().take() {
                run();
            }
            None
        });
        task.set_causality(causality);
        task
    }
}

/// Port-side bucket of a gather.
///
/// Buckets hold the core strongly: the gather must stay live while any
/// port still references a bucket, whether or not the caller kept the
/// [`Gather`] handle.
struct GatherBucket<T: Send + 'static> {
    id: u64,
    port: Port<T>,
    items: Mutex<Vec<Element<T>>>,
    core: OnceLock<Arc<GatherCore>>,
}

impl<T: Send + 'static> GatherBucket<T> {
    fn new(port: Port<T>) -> Arc<Self> {
        Arc::new(Self {
            id: next_arm_id(),
            port,
            items: Mutex::new(Vec::new()),
            core: OnceLock::new(),
        })
    }

    fn core(&self) -> Option<Arc<GatherCore>> {
        self.core.get().cloned()
    }

    fn drain_items(&self) -> Vec<T> {
        self.items
            .lock()
            .drain(..)
            .map(|element| element.item)
            .collect()
    }

    /// Reposts gathered elements at the head of the port, order preserved.
    fn unroll_items(&self) {
        let elements: Vec<Element<T>> = self.items.lock().drain(..).collect();
        for element in elements.into_iter().rev() {
            self.port.post_element(element, true);
        }
    }
}

impl<T: Send + 'static> PortArm<T> for GatherBucket<T> {
    fn arm_id(&self) -> u64 {
        self.id
    }

    fn is_retired(&self) -> bool {
        self.core()
            .map_or(true, |core| core.retired.load(Ordering::Acquire))
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn offer(&self, element: Element<T>) -> Offer<T> {
        let Some(core) = self.core() else {
            return Offer::Declined(element, None);
        };
        if core.retired.load(Ordering::Acquire) {
            return Offer::Declined(element, None);
        }
        let remaining = core.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < 0 {
            core.pending.fetch_add(1, Ordering::AcqRel);
            return Offer::Declined(element, None);
        }
        if let Some(context) = &element.causality {
            let mut merged = core.merged.lock();
            match merged.as_mut() {
                Some(m) => m.merge(context),
                None => *merged = Some(context.clone()),
            }
        }
        self.items.lock().push(element);
        if remaining == 0 {
            Offer::Consumed(Some(core.completion_task()))
        } else {
            Offer::Consumed(None)
        }
    }

    fn task_queue(&self) -> Option<DispatcherQueue> {
        self.core().map(|core| core.queue.clone())
    }
}

/// Handle to an activated gather.
///
/// The handle only enables cancellation; dropping it leaves the gather
/// running to completion.
pub struct Gather {
    core: Arc<GatherCore>,
}

impl Gather {
    /// Cancels an incomplete gather: detaches its buckets and reposts
    /// everything gathered so far. A no-op once completion has fired.
    pub fn cancel(&self) {
        if self.core.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        for detach in self.core.detachers.lock().drain(..) {
            detach();
        }
        // forfeit the handler before unrolling
        drop(self.core.completion.lock().take());
        for unroll in self.core.unrollers.lock().drain(..) {
            unroll();
        }
    }
}

fn new_core(queue: &DispatcherQueue, total: usize) -> Arc<GatherCore> {
    Arc::new(GatherCore {
        pending: AtomicI64::new(total as i64),
        retired: AtomicBool::new(false),
        queue: queue.clone(),
        completion: Mutex::new(None),
        merged: Mutex::new(None),
        unrollers: Mutex::new(Vec::new()),
        detachers: Mutex::new(Vec::new()),
    })
}

fn wire_bucket<T: Send + 'static>(
    core: &Arc<GatherCore>,
    bucket: &Arc<GatherBucket<T>>,
) {
    let _ = bucket.core.set(Arc::clone(core));
    let unroll_bucket = Arc::clone(bucket);
    core.unrollers
        .lock()
        .push(Box::new(move || unroll_bucket.unroll_items()));
    let port = bucket.port.clone();
    let id = bucket.id;
    core.detachers
        .lock()
        .push(Box::new(move || port.unregister_arm(id)));
}

/// Activates a gather over a single port: `handler` runs once `total`
/// messages have been collected.
pub fn gather1<T: Send + 'static>(
    queue: &DispatcherQueue,
    port: &Port<T>,
    total: usize,
    handler: impl FnOnce(Vec<T>) + Send + 'static,
) -> Result<Gather, ArbiterError> {
    if total == 0 {
        return Err(ArbiterError::InvalidItemCount);
    }
    let core = new_core(queue, total);
    let bucket = GatherBucket::new(port.clone());
    wire_bucket(&core, &bucket);
    {
        let bucket = Arc::clone(&bucket);
        *core.completion.lock() = Some(Box::new(move || {
            handler(bucket.drain_items());
        }));
    }
    port.register_arm(bucket)?;
    Ok(Gather { core })
}

/// Activates a gather over two ports: `handler` runs once `total` messages
/// have been collected across both.
pub fn gather2<A: Send + 'static, B: Send + 'static>(
    queue: &DispatcherQueue,
    port_a: &Port<A>,
    port_b: &Port<B>,
    total: usize,
    handler: impl FnOnce(Vec<A>, Vec<B>) + Send + 'static,
) -> Result<Gather, ArbiterError> {
    if total == 0 {
        return Err(ArbiterError::InvalidItemCount);
    }
    let core = new_core(queue, total);
    let bucket_a = GatherBucket::new(port_a.clone());
    let bucket_b = GatherBucket::new(port_b.clone());
    wire_bucket(&core, &bucket_a);
    wire_bucket(&core, &bucket_b);
    {
        let (a, b) = (Arc::clone(&bucket_a), Arc::clone(&bucket_b));
        *core.completion.lock() = Some(Box::new(move || {
            handler(a.drain_items(), b.drain_items());
        }));
    }
    port_a.register_arm(bucket_a)?;
    port_b.register_arm(bucket_b)?;
    Ok(Gather { core })
}

/// Activates a gather over three ports.
pub fn gather3<A: Send + 'static, B: Send + 'static, C: Send + 'static>(
    queue: &DispatcherQueue,
    port_a: &Port<A>,
    port_b: &Port<B>,
    port_c: &Port<C>,
    total: usize,
    handler: impl FnOnce(Vec<A>, Vec<B>, Vec<C>) + Send + 'static,
) -> Result<Gather, ArbiterError> {
    if total == 0 {
        return Err(ArbiterError::InvalidItemCount);
    }
    let core = new_core(queue, total);
    let bucket_a = GatherBucket::new(port_a.clone());
    let bucket_b = GatherBucket::new(port_b.clone());
    let bucket_c = GatherBucket::new(port_c.clone());
    wire_bucket(&core, &bucket_a);
    wire_bucket(&core, &bucket_b);
    wire_bucket(&core, &bucket_c);
    {
        let (a, b, c) = (
            Arc::clone(&bucket_a),
            Arc::clone(&bucket_b),
            Arc::clone(&bucket_c),
        );
        *core.completion.lock() = Some(Box::new(move || {
            handler(a.drain_items(), b.drain_items(), c.drain_items());
        }));
    }
    port_a.register_arm(bucket_a)?;
    port_b.register_arm(bucket_b)?;
    port_c.register_arm(bucket_c)?;
    Ok(Gather { core })
}
