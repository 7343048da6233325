//! Reconciliation state shared between the walking thread and receivers.

use super::stats::RunStatistics;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

/// Result of matching a delivered instance id against the expected set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Was expected; removed from the set.
    Expected,
    /// Already delivered earlier in this run.
    Duplicate,
    /// Never requested.
    Unrequested,
}

/// Point-in-time view used by the quiescence monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub version: u64,
    pub arrivals: u64,
    pub outstanding: usize,
    pub inactivity: Duration,
}

#[derive(Debug)]
struct Reconciliation {
    expected: HashSet<String>,
    delivered: HashSet<String>,
    expected_classes: BTreeSet<String>,
    inactivity: Duration,
    arrivals: u64,
    version: u64,
    window_started: Instant,
    window_bytes: u64,
}

/// Every piece of mutable state the engine shares across threads.
///
/// Set mutations and emptiness checks happen under one lock; waiters on
/// `changed` are woken on every arrival and every expected-set change.
#[derive(Debug)]
pub struct SynchronizationContext {
    state: Mutex<Reconciliation>,
    changed: Condvar,
    stats: RunStatistics,
}

impl Default for SynchronizationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SynchronizationContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Reconciliation {
                expected: HashSet::new(),
                delivered: HashSet::new(),
                expected_classes: BTreeSet::new(),
                inactivity: Duration::ZERO,
                arrivals: 0,
                version: 0,
                window_started: Instant::now(),
                window_bytes: 0,
            }),
            changed: Condvar::new(),
            stats: RunStatistics::new(),
        }
    }

    pub fn stats(&self) -> &RunStatistics {
        &self.stats
    }

    /// Record that `id` is promised by a retrieval about to be dispatched.
    /// Returns false if it was already expected.
    pub fn expect_instance(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let inserted = state.expected.insert(id.to_string());
        if inserted {
            state.version += 1;
        }
        inserted
    }

    pub fn add_expected_classes<I>(&self, classes: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.state.lock().expected_classes.extend(classes);
    }

    pub fn expected_classes(&self) -> BTreeSet<String> {
        self.state.lock().expected_classes.clone()
    }

    pub fn clear_expected_classes(&self) {
        self.state.lock().expected_classes.clear();
    }

    /// A new object arrived: reset the inactivity clock and wake waiters.
    pub fn record_arrival(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.inactivity = Duration::ZERO;
        state.arrivals += 1;
        state.version += 1;
        state.window_bytes += bytes;
        self.stats.record_received(bytes);
        drop(state);
        self.changed.notify_all();
    }

    /// Match a delivered instance id against the expected set. Removal
    /// happens at most once per id.
    pub fn claim_instance(&self, id: &str) -> Claim {
        let mut state = self.state.lock();
        let first_delivery = state.delivered.insert(id.to_string());
        let claim = if state.expected.remove(id) {
            state.version += 1;
            Claim::Expected
        } else if first_delivery {
            Claim::Unrequested
        } else {
            Claim::Duplicate
        };
        drop(state);
        if claim == Claim::Expected {
            self.changed.notify_all();
        }
        claim
    }

    pub fn outstanding_count(&self) -> usize {
        self.state.lock().expected.len()
    }

    /// Expected ids still missing, sorted.
    pub fn outstanding(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state.expected.iter().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn inactivity(&self) -> Duration {
        self.state.lock().inactivity
    }

    pub fn observe(&self) -> Observation {
        let state = self.state.lock();
        Observation {
            version: state.version,
            arrivals: state.arrivals,
            outstanding: state.expected.len(),
            inactivity: state.inactivity,
        }
    }

    /// Block until anything changes after `seen`, or until `timeout`.
    ///
    /// The inactivity clock advances by the time spent waiting only when no
    /// object arrived meanwhile.
    pub fn wait_for_change(&self, seen: &Observation, timeout: Duration) {
        let mut state = self.state.lock();
        if state.version != seen.version {
            return;
        }
        let started = Instant::now();
        let _ = self.changed.wait_for(&mut state, timeout);
        if state.arrivals == seen.arrivals {
            state.inactivity += started.elapsed();
        }
    }

    /// Start a fresh byte/time window for one dispatch.
    pub fn reset_transfer_window(&self) {
        let mut state = self.state.lock();
        state.window_started = Instant::now();
        state.window_bytes = 0;
    }

    /// Bytes received and time elapsed since the last reset.
    pub fn transfer_window(&self) -> (u64, Duration) {
        let state = self.state.lock();
        (state.window_bytes, state.window_started.elapsed())
    }
}
