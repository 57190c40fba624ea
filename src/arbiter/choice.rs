//! First-wins choice over a set of one-shot branches.
//!
//! A choice activates its branches and commits exactly one: the first
//! branch whose delivery passes evaluation wins, and the winning task is
//! rewrapped so that, before the user handler runs, every sibling branch
//! is retired. Losing evaluations are vetoed, so their elements stay in
//! their ports.
//!
//! The commit decision is a single atomic counter: activation moves the
//! stage to *pending*, the winning evaluation increments it to *committed*,
//! and every later evaluation observes a stage past committed and loses.
//! Two branches firing on different threads therefore cannot both win.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arbiter::{Arbiter, ArbiterState, Arm, Branch, BranchContext};
use crate::error::ArbiterError;
use crate::queue::DispatcherQueue;
use crate::task::Task;

const STAGE_PENDING: u32 = 1;
const STAGE_COMMITTED: u32 = 2;

/// A one-of-N arbiter.
pub struct Choice {
    stage: AtomicU32,
    branches: Mutex<Vec<Arc<dyn Arm>>>,
    queue: DispatcherQueue,
}

impl Choice {
    /// Activates a choice over `branches` on `queue`.
    ///
    /// Every branch must be one-shot; a persistent branch could starve its
    /// siblings forever without ever resolving the choice.
    pub fn activate(
        queue: &DispatcherQueue,
        branches: Vec<Branch>,
    ) -> Result<(), ArbiterError> {
        if branches.is_empty() {
            return Err(ArbiterError::EmptyChoice);
        }
        if branches.iter().any(Branch::is_persistent) {
            return Err(ArbiterError::PersistentChoiceBranch);
        }
        let arms: Vec<Arc<dyn Arm>> = branches.into_iter().map(|b| b.arm).collect();
        let choice = Arc::new(Self {
            stage: AtomicU32::new(STAGE_PENDING),
            branches: Mutex::new(arms.clone()),
            queue: queue.clone(),
        });
        // a branch may fire during registration; siblings attached later
        // observe their retirement and skip registration
        for arm in arms {
            arm.attach(queue, Some(choice.clone() as Arc<dyn Arbiter>))?;
        }
        Ok(())
    }
}

impl Arbiter for Choice {
    fn evaluate(&self, _branch: &BranchContext, slot: &mut Option<Task>) -> bool {
        let stage = self.stage.fetch_add(1, Ordering::AcqRel) + 1;
        if stage != STAGE_COMMITTED {
            // a sibling already committed
            *slot = None;
            return false;
        }
        let winner = slot.take();
        let siblings = self.branches.lock().clone();
        let queue = self.queue.clone();
        let causality = winner.as_ref().and_then(|t| t.causality.clone());
        // park the winner in a cell so an abandoned wrapper can still
        // unroll it
        let cell = Arc::new(Mutex::new(winner));
        let body_cell = Arc::clone(&cell);
        let mut wrapped = Task::from_body(move || {
            for sibling in &siblings {
                sibling.retire();
            }
            if let Some(winner) = body_cell.lock().take() {
                queue.schedule(winner);
            }
            None
        });
        wrapped.set_causality(causality);
        wrapped.set_unroll(Box::new(move || {
            if let Some(winner) = cell.lock().take() {
                winner.abandon();
            }
        }));
        *slot = Some(wrapped);
        true
    }

    fn state(&self) -> ArbiterState {
        if self.stage.load(Ordering::Acquire) >= STAGE_COMMITTED {
            ArbiterState::Done
        } else {
            ArbiterState::Active
        }
    }
}
