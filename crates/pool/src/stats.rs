//! Pool gauges and counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::state::State;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolStats {
    /// Live connections plus creations in flight.
    pub size: usize,
    /// Connections checked in and ready.
    pub idle: usize,
    /// Connections checked out.
    pub active: usize,
    /// Creations in flight.
    pub pending: usize,
    /// Callers blocked in `acquire`.
    pub waiters: usize,
    /// Highest `active` ever observed.
    pub max_used: usize,
    /// Total connections ever created.
    pub created: u64,
    /// Total connections ever destroyed.
    pub destroyed: u64,
    /// Total successful acquisitions.
    pub acquired: u64,
    /// Total returns.
    pub returned: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
    /// Factory failures.
    pub creation_failures: u64,
    /// Connections that failed validation.
    pub validation_failures: u64,
    /// Leak notifications issued.
    pub leaks_suspected: u64,
    /// Idle connections reaped.
    pub reaped: u64,
}

/// Live gauges, updated alongside every state transition.
#[derive(Debug, Default)]
pub(crate) struct Gauges {
    by_state: [AtomicUsize; State::ALL.len()],
    max_used: AtomicUsize,
}

impl Gauges {
    pub(crate) fn enter(&self, state: State) {
        let now = self.by_state[state.index()].fetch_add(1, Ordering::SeqCst) + 1;
        if state == State::CheckedOut {
            self.max_used.fetch_max(now, Ordering::SeqCst);
        }
    }

    pub(crate) fn leave(&self, state: State) {
        self.by_state[state.index()].fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn moved(&self, from: State, to: State) {
        if !to.is_terminal() {
            self.enter(to);
        }
        self.leave(from);
    }

    pub(crate) fn count(&self, state: State) -> usize {
        self.by_state[state.index()].load(Ordering::SeqCst)
    }

    pub(crate) fn max_used(&self) -> usize {
        self.max_used.load(Ordering::SeqCst)
    }
}

/// Lifetime counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) created: AtomicU64,
    pub(crate) destroyed: AtomicU64,
    pub(crate) acquired: AtomicU64,
    pub(crate) returned: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) creation_failures: AtomicU64,
    pub(crate) validation_failures: AtomicU64,
    pub(crate) leaks_suspected: AtomicU64,
    pub(crate) reaped: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fill(&self, stats: &mut PoolStats) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        stats.created = load(&self.created);
        stats.destroyed = load(&self.destroyed);
        stats.acquired = load(&self.acquired);
        stats.returned = load(&self.returned);
        stats.timeouts = load(&self.timeouts);
        stats.creation_failures = load(&self.creation_failures);
        stats.validation_failures = load(&self.validation_failures);
        stats.leaks_suspected = load(&self.leaks_suspected);
        stats.reaped = load(&self.reaped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_used_tracks_checkout_peak() {
        let gauges = Gauges::default();
        gauges.enter(State::CheckedIn);
        gauges.enter(State::CheckedIn);
        gauges.moved(State::CheckedIn, State::CheckedOut);
        gauges.moved(State::CheckedIn, State::CheckedOut);
        gauges.moved(State::CheckedOut, State::CheckedIn);
        assert_eq!(gauges.count(State::CheckedOut), 1);
        assert_eq!(gauges.count(State::CheckedIn), 1);
        assert_eq!(gauges.max_used(), 2);
    }

    #[test]
    fn counters_fill_snapshot() {
        let counters = Counters::default();
        Counters::bump(&counters.created);
        Counters::bump(&counters.created);
        Counters::bump(&counters.timeouts);
        let mut stats = PoolStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.destroyed, 0);
    }
}
