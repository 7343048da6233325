//! End-of-run detection: wait until every expected object arrived or the run
//! has gone quiet for long enough.

use super::context::{Observation, SynchronizationContext};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);
pub const DEFAULT_IDLE_CEILING: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuiescencePolicy {
    /// Wait for the expected set to drain or the idle ceiling.
    Wait,
    /// Return as soon as every retrieval has been dispatched.
    Skip,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuiescenceConfig {
    pub policy: QuiescencePolicy,
    pub poll_interval: Duration,
    pub idle_ceiling: Duration,
    /// Ignore an empty expected set and end only on the idle ceiling. Used when
    /// arrivals are not tracked per instance.
    pub require_idle: bool,
}

impl Default for QuiescenceConfig {
    fn default() -> Self {
        Self {
            policy: QuiescencePolicy::Wait,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_ceiling: DEFAULT_IDLE_CEILING,
            require_idle: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Drained,
    IdleCeiling,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Active,
    Done(DoneReason),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuiescenceReport {
    pub reason: DoneReason,
    pub waited_ms: u64,
    pub polls: u64,
    pub outstanding: usize,
}

pub struct QuiescenceMonitor<'a> {
    context: &'a SynchronizationContext,
    config: QuiescenceConfig,
}

impl<'a> QuiescenceMonitor<'a> {
    pub fn new(context: &'a SynchronizationContext, config: QuiescenceConfig) -> Self {
        Self { context, config }
    }

    pub fn state(&self, observation: &Observation) -> MonitorState {
        if self.config.policy == QuiescencePolicy::Skip {
            return MonitorState::Done(DoneReason::Skipped);
        }
        if observation.outstanding == 0 && !self.config.require_idle {
            return MonitorState::Done(DoneReason::Drained);
        }
        if observation.inactivity > self.config.idle_ceiling {
            return MonitorState::Done(DoneReason::IdleCeiling);
        }
        MonitorState::Active
    }

    /// Block the calling thread until the run is done.
    pub fn run(&self) -> QuiescenceReport {
        let started = Instant::now();
        let mut polls = 0u64;
        let reason = loop {
            let observation = self.context.observe();
            match self.state(&observation) {
                MonitorState::Done(reason) => break reason,
                MonitorState::Active => {
                    if polls % 10 == 0 {
                        debug!(
                            outstanding = observation.outstanding,
                            idle_ms = observation.inactivity.as_millis() as u64,
                            "waiting for arrivals"
                        );
                    }
                    self.context
                        .wait_for_change(&observation, self.config.poll_interval);
                    polls += 1;
                }
            }
        };

        let outstanding = self.context.outstanding_count();
        match reason {
            DoneReason::IdleCeiling if outstanding > 0 => warn!(
                outstanding,
                idle_ceiling_secs = self.config.idle_ceiling.as_secs(),
                "run went quiet with objects still outstanding"
            ),
            DoneReason::Skipped => info!(outstanding, "quiescence wait skipped"),
            _ => info!(reason = ?reason, "run is quiescent"),
        }
        QuiescenceReport {
            reason,
            waited_ms: started.elapsed().as_millis() as u64,
            polls,
            outstanding,
        }
    }
}
