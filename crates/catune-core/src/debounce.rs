//! Per-cell single-shot debounce timers (spec §4.4 "Debounce").
//!
//! No teacher analog — the WASM solver is driven synchronously by whatever
//! debouncing the JS UI layer already does. Adapted in spirit from
//! `freddiehaddad-oxidized`'s `TickEventSource` (a named, periodic event
//! fed into a single control-thread loop) but collapsed to single-shot
//! deadlines tracked on that same control thread rather than a spawned
//! async task, since the manager already owns one loop that selects over
//! `crossbeam-channel` receivers (spec §5 "single control thread").

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Tracks one pending deadline per cell. A new `schedule` call for a cell
/// silently replaces any prior deadline — "each new trigger cancels any
/// pending timer" (spec §4.4).
#[derive(Default)]
pub struct DebounceScheduler {
    deadlines: BTreeMap<usize, Instant>,
}

impl DebounceScheduler {
    pub fn new() -> Self {
        DebounceScheduler { deadlines: BTreeMap::new() }
    }

    pub fn schedule(&mut self, cell_index: usize, delay: Duration, now: Instant) {
        self.deadlines.insert(cell_index, now + delay);
    }

    pub fn cancel(&mut self, cell_index: usize) {
        self.deadlines.remove(&cell_index);
    }

    /// Earliest pending deadline across all cells, used by the manager's
    /// event loop to bound how long it may block on `results_rx`.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every cell whose deadline has elapsed as of `now`,
    /// in cell-index order (stable, not priority-meaningful — priority is
    /// the pool's job, not the debounce scheduler's).
    pub fn take_due(&mut self, now: Instant) -> Vec<usize> {
        let due: Vec<usize> = self
            .deadlines
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(&cell, _)| cell)
            .collect();
        for cell in &due {
            self.deadlines.remove(cell);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_then_take_due_after_delay() {
        let mut sched = DebounceScheduler::new();
        let t0 = Instant::now();
        sched.schedule(3, Duration::from_millis(30), t0);
        assert!(sched.take_due(t0).is_empty());
        assert_eq!(sched.take_due(t0 + Duration::from_millis(31)), vec![3]);
    }

    #[test]
    fn rescheduling_cancels_prior_deadline() {
        let mut sched = DebounceScheduler::new();
        let t0 = Instant::now();
        sched.schedule(1, Duration::from_millis(30), t0);
        sched.schedule(1, Duration::from_millis(30), t0 + Duration::from_millis(20));
        // Original deadline (t0+30ms) has passed, but the reschedule pushed it to t0+50ms.
        assert!(sched.take_due(t0 + Duration::from_millis(31)).is_empty());
        assert_eq!(sched.take_due(t0 + Duration::from_millis(51)), vec![1]);
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut sched = DebounceScheduler::new();
        let t0 = Instant::now();
        sched.schedule(5, Duration::from_millis(10), t0);
        sched.cancel(5);
        assert!(sched.take_due(t0 + Duration::from_millis(20)).is_empty());
    }

    #[test]
    fn next_deadline_is_the_earliest() {
        let mut sched = DebounceScheduler::new();
        let t0 = Instant::now();
        sched.schedule(1, Duration::from_millis(50), t0);
        sched.schedule(2, Duration::from_millis(10), t0);
        assert_eq!(sched.next_deadline(), Some(t0 + Duration::from_millis(10)));
    }

    #[test]
    fn multiple_due_cells_all_returned() {
        let mut sched = DebounceScheduler::new();
        let t0 = Instant::now();
        sched.schedule(1, Duration::from_millis(10), t0);
        sched.schedule(2, Duration::from_millis(10), t0);
        let mut due = sched.take_due(t0 + Duration::from_millis(11));
        due.sort_unstable();
        assert_eq!(due, vec![1, 2]);
    }
}
