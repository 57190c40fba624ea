//! Deadline-keyed timer storage for a dispatcher queue.
//!
//! Timers are kept in a `BTreeMap` keyed by deadline; all timers sharing a
//! deadline live in one bucket. Workers poll the table while scanning
//! queues and fire every bucket whose deadline has passed. Firing posts
//! the deadline to the timer's port under the causality context captured
//! when the timer was scheduled.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::causality::CausalitySet;
use crate::port::Port;

pub(crate) struct TimerEntry {
    pub(crate) port: Port<Instant>,
    pub(crate) causality: Option<CausalitySet>,
}

#[derive(Default)]
pub(crate) struct TimerTable {
    table: Mutex<BTreeMap<Instant, Vec<TimerEntry>>>,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a timer. Returns whether it became the earliest deadline, in
    /// which case sleeping workers need a nudge to shorten their waits.
    pub(crate) fn schedule(&self, deadline: Instant, entry: TimerEntry) -> bool {
        let mut table = self.table.lock();
        let was_earliest = table
            .keys()
            .next()
            .map_or(true, |earliest| deadline < *earliest);
        table.entry(deadline).or_default().push(entry);
        was_earliest
    }

    /// Removes and returns every entry whose deadline has passed.
    pub(crate) fn take_due(&self, now: Instant) -> Vec<TimerEntry> {
        let mut table = self.table.lock();
        if table.keys().next().map_or(true, |earliest| *earliest > now) {
            return Vec::new();
        }
        let remaining = table.split_off(&now);
        let mut due: Vec<TimerEntry> = table
            .iter_mut()
            .flat_map(|(_, entries)| entries.drain(..))
            .collect();
        *table = remaining;
        // split_off keeps the exact key in the right half
        if let Some(entries) = table.remove(&now) {
            due.extend(entries);
        }
        due
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.table.lock().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.table.lock().clear();
    }
}

/// Fires due entries: posts `now` to each port under the timer's captured
/// causality context. Called with no locks held.
pub(crate) fn fire(entries: Vec<TimerEntry>, now: Instant) {
    for entry in entries {
        crate::causality::install(entry.causality);
        entry.port.post(now);
    }
    crate::causality::clear_causalities();
}
