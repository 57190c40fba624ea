//! Interleave: reader-writer scheduling across receiver groups.
//!
//! An interleave owns three groups of branches:
//!
//! - **exclusive**: handlers run one at a time, never overlapping any
//!   other branch of the interleave;
//! - **concurrent**: handlers may overlap each other, but not an exclusive
//!   handler;
//! - **teardown**: one-shot exclusive branches; the first to fire retires
//!   the whole interleave.
//!
//! The slot discipline is a writer-preferring reader-writer protocol kept
//! in a single gate: `exclusive_active` is `1` while an exclusive handler
//! runs, `-1` while one is waiting for readers to drain (new readers are
//! refused in that window), `0` otherwise; `concurrent_active` counts
//! running readers. A task that cannot be granted a slot is parked on its
//! branch's pending queue and replayed round-robin as slots free up, so a
//! busy branch cannot starve its siblings. Each granted task gets a
//! finalizer that releases its slot and replays pending work; the finalizer
//! runs even when the handler panics.
//!
//! # Teardown
//!
//! The first teardown firing atomically marks the interleave done; from
//! then on every new delivery is vetoed and stays in its port. The
//! teardown handler itself waits until running handlers drain, then all
//! branches are retired, parked tasks are unrolled (their messages repost
//! to their ports), and only then does the teardown handler run. Pending
//! work parked before the teardown fired is deliberately not replayed.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::arbiter::{Arbiter, ArbiterState, Arm, Branch, BranchContext, InterleaveGroup};
use crate::error::ArbiterError;
use crate::queue::DispatcherQueue;
use crate::task::Task;

/// Branches whose first firing retires the interleave. Must be one-shot.
pub struct TeardownGroup(pub Vec<Branch>);

/// Branches whose handlers never overlap any other branch.
pub struct ExclusiveGroup(pub Vec<Branch>);

/// Branches whose handlers may overlap each other. Must be persistent.
pub struct ConcurrentGroup(pub Vec<Branch>);

const STATE_ACTIVE: u8 = 0;
const STATE_DONE: u8 = 1;

struct Gate {
    /// `1` exclusive running, `-1` exclusive waiting on readers, `0` idle.
    exclusive_active: i32,
    /// Number of running concurrent handlers.
    concurrent_active: i32,
    /// Stashed teardown handler task, waiting for the drain.
    final_task: Option<Task>,
    mutex_arms: Vec<Arc<dyn Arm>>,
    concurrent_arms: Vec<Arc<dyn Arm>>,
    next_mutex: usize,
    next_concurrent: usize,
    cleanup_done: bool,
}

impl Gate {
    /// Grants or refuses a slot. Refused exclusives park a reservation so
    /// new readers are turned away while they wait.
    fn arbitrate(&mut self, exclusive: bool) -> bool {
        if exclusive {
            if self.exclusive_active == 0 {
                if self.concurrent_active > 0 {
                    self.exclusive_active = -1;
                    false
                } else {
                    self.exclusive_active = 1;
                    true
                }
            } else if self.exclusive_active == -1 && self.concurrent_active == 0 {
                self.exclusive_active = 1;
                true
            } else {
                false
            }
        } else if self.exclusive_active == 0 {
            self.concurrent_active += 1;
            true
        } else {
            false
        }
    }

    /// Round-robin pick of a parked task from one group, if a slot can be
    /// granted for it.
    fn next_pending(&mut self, exclusive: bool) -> Option<Task> {
        let len = if exclusive {
            self.mutex_arms.len()
        } else {
            self.concurrent_arms.len()
        };
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let idx = if exclusive {
                let idx = self.next_mutex % len;
                self.next_mutex = self.next_mutex.wrapping_add(1);
                idx
            } else {
                let idx = self.next_concurrent % len;
                self.next_concurrent = self.next_concurrent.wrapping_add(1);
                idx
            };
            let context = if exclusive {
                self.mutex_arms[idx].branch_context()
            } else {
                self.concurrent_arms[idx].branch_context()
            };
            if context.has_pending() {
                if !self.arbitrate(exclusive) {
                    return None;
                }
                if let Some(task) = context.pop_pending() {
                    return Some(task);
                }
                // raced with teardown draining the queue; release the slot
                if exclusive {
                    self.exclusive_active = 0;
                } else {
                    self.concurrent_active -= 1;
                }
            }
        }
        None
    }
}

/// A reader-writer arbiter over branch groups.
pub struct Interleave {
    weak: Weak<Self>,
    queue: DispatcherQueue,
    state: AtomicU8,
    gate: Mutex<Gate>,
}

impl Interleave {
    /// Activates an interleave on `queue`.
    pub fn activate(
        queue: &DispatcherQueue,
        teardown: TeardownGroup,
        exclusive: ExclusiveGroup,
        concurrent: ConcurrentGroup,
    ) -> Result<Arc<Self>, ArbiterError> {
        if teardown.0.iter().any(Branch::is_persistent) {
            return Err(ArbiterError::PersistentTeardownBranch);
        }
        if concurrent.0.iter().any(|b| !b.is_persistent()) {
            return Err(ArbiterError::OneShotConcurrentBranch);
        }

        let mut mutex_arms: Vec<Arc<dyn Arm>> = Vec::new();
        for branch in teardown.0 {
            branch.arm.branch_context().set_group(InterleaveGroup::Teardown);
            mutex_arms.push(branch.arm);
        }
        for branch in exclusive.0 {
            branch.arm.branch_context().set_group(InterleaveGroup::Exclusive);
            mutex_arms.push(branch.arm);
        }
        let mut concurrent_arms: Vec<Arc<dyn Arm>> = Vec::new();
        for branch in concurrent.0 {
            branch
                .arm
                .branch_context()
                .set_group(InterleaveGroup::Concurrent);
            concurrent_arms.push(branch.arm);
        }

        let interleave = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            queue: queue.clone(),
            state: AtomicU8::new(STATE_ACTIVE),
            gate: Mutex::new(Gate {
                exclusive_active: 0,
                concurrent_active: 0,
                final_task: None,
                mutex_arms: mutex_arms.clone(),
                concurrent_arms: concurrent_arms.clone(),
                next_mutex: 0,
                next_concurrent: 0,
                cleanup_done: false,
            }),
        });

        for arm in mutex_arms.into_iter().chain(concurrent_arms) {
            arm.attach(queue, Some(interleave.clone() as Arc<dyn Arbiter>))?;
        }
        Ok(interleave)
    }

    /// Whether the interleave has been torn down.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DONE
    }

    /// Finalizer attached to every granted task: releases the slot and
    /// replays parked work (or fires the teardown once drained).
    fn slot_finalizer(&self, exclusive: bool) -> Box<dyn FnOnce() + Send> {
        let weak = self.weak.clone();
        Box::new(move || {
            if let Some(interleave) = weak.upgrade() {
                interleave.release_slot(exclusive);
            }
        })
    }

    fn release_slot(self: &Arc<Self>, exclusive: bool) {
        let mut replays: Vec<Task> = Vec::new();
        let mut teardown: Option<Task> = None;
        {
            let mut gate = self.gate.lock();
            if exclusive {
                gate.exclusive_active = 0;
            } else {
                gate.concurrent_active -= 1;
            }
            if self.is_done() {
                if gate.concurrent_active == 0 && gate.exclusive_active <= 0 {
                    if let Some(winner) = gate.final_task.take() {
                        teardown = Some(self.make_teardown_task(winner));
                    }
                }
            } else if let Some(mut task) = gate.next_pending(true) {
                task.set_finalizer(self.slot_finalizer(true));
                replays.push(task);
            } else {
                while let Some(mut task) = gate.next_pending(false) {
                    task.set_finalizer(self.slot_finalizer(false));
                    replays.push(task);
                }
            }
        }
        for task in replays {
            self.queue.schedule(task);
        }
        if let Some(task) = teardown {
            self.queue.schedule(task);
        }
    }

    /// Wraps the stashed teardown handler: retire everything, unroll
    /// parked work, then run the handler.
    fn make_teardown_task(self: &Arc<Self>, winner: Task) -> Task {
        let causality = winner.causality.clone();
        let cell = Arc::new(Mutex::new(Some(winner)));
        let weak = self.weak.clone();
        let queue = self.queue.clone();
        let body_cell = Arc::clone(&cell);
        let mut task = Task::from_body(move || {
            if let Some(interleave) = weak.upgrade() {
                interleave.run_cleanup();
            }
            if let Some(winner) = body_cell.lock().take() {
                queue.schedule(winner);
            }
            None
        });
        task.set_causality(causality);
        task.set_unroll(Box::new(move || {
            if let Some(winner) = cell.lock().take() {
                winner.abandon();
            }
        }));
        task
    }

    fn run_cleanup(&self) {
        let arms = {
            let mut gate = self.gate.lock();
            if gate.cleanup_done {
                return;
            }
            gate.cleanup_done = true;
            let mut arms = gate.mutex_arms.clone();
            arms.extend(gate.concurrent_arms.iter().cloned());
            arms
        };
        for arm in &arms {
            for task in arm.branch_context().drain_pending() {
                task.abandon();
            }
            arm.retire();
        }
    }
}

impl Arbiter for Interleave {
    fn evaluate(&self, branch: &BranchContext, slot: &mut Option<Task>) -> bool {
        if self.is_done() {
            *slot = None;
            return false;
        }
        let group = branch.group().unwrap_or(InterleaveGroup::Exclusive);
        // granted tasks stay in the slot: the port dispatches them after
        // releasing its lock, so nothing is enqueued from in here
        let mut gate = self.gate.lock();
        if group == InterleaveGroup::Teardown {
            if self
                .state
                .compare_exchange(
                    STATE_ACTIVE,
                    STATE_DONE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // a sibling teardown won
                *slot = None;
                return false;
            }
            gate.final_task = slot.take();
            if gate.arbitrate(true) {
                // nothing running; tear down immediately
                if let Some(winner) = gate.final_task.take() {
                    if let Some(this) = self.weak.upgrade() {
                        *slot = Some(this.make_teardown_task(winner));
                    }
                }
            }
        } else if group == InterleaveGroup::Exclusive {
            if gate.arbitrate(true) {
                if let Some(task) = slot.as_mut() {
                    task.set_finalizer(self.slot_finalizer(true));
                }
            } else if let Some(task) = slot.take() {
                branch.push_pending(task);
            }
        } else if gate.arbitrate(false) {
            if let Some(task) = slot.as_mut() {
                task.set_finalizer(self.slot_finalizer(false));
            }
        } else if let Some(task) = slot.take() {
            branch.push_pending(task);
        }
        true
    }

    fn state(&self) -> ArbiterState {
        if self.is_done() {
            ArbiterState::Done
        } else {
            ArbiterState::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_prefers_waiting_writer() {
        let mut gate = Gate {
            exclusive_active: 0,
            concurrent_active: 0,
            final_task: None,
            mutex_arms: Vec::new(),
            concurrent_arms: Vec::new(),
            next_mutex: 0,
            next_concurrent: 0,
            cleanup_done: false,
        };
        assert!(gate.arbitrate(false));
        assert!(gate.arbitrate(false));
        // writer must wait for both readers, parking a reservation
        assert!(!gate.arbitrate(true));
        assert_eq!(gate.exclusive_active, -1);
        // new readers are refused while the writer waits
        assert!(!gate.arbitrate(false));
        gate.concurrent_active -= 1;
        gate.concurrent_active -= 1;
        assert!(gate.arbitrate(true));
        assert_eq!(gate.exclusive_active, 1);
        // nothing else runs alongside the writer
        assert!(!gate.arbitrate(false));
        assert!(!gate.arbitrate(true));
    }
}
