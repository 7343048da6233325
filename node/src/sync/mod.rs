//! Reconciliation engine.
//!
//! - `walker`: decides which subtrees are missing and requests each once
//! - `dispatch`: issues one push or pull retrieval
//! - `receiver`: classifies, places and indexes every inbound object
//! - `quiescence`: decides when the run is finished
//! - `context`: shared expected set, class set, inactivity clock and statistics

mod context;
mod dispatch;
mod quiescence;
mod receiver;
mod stats;
mod walker;

pub use context::SynchronizationContext;
pub use dispatch::RetrievalDispatcher;
#[cfg(test)]
pub use quiescence::DoneReason;
pub use quiescence::{QuiescenceConfig, QuiescenceMonitor, QuiescencePolicy, QuiescenceReport};
pub use receiver::Receiver;
pub use stats::RunSummary;
pub use walker::{TreeWalker, WalkReport};

use serde::Serialize;

/// How missing subtrees are retrieved. Selected once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RetrievalMode {
    /// The archive pushes objects to our listener ("move").
    Push,
    /// Objects stream back over the requesting association ("get").
    Pull,
}

/// Depth of the query tree and of expected-set tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    /// Studies only; arrivals are indexed without per-instance tracking.
    Study,
    Instance,
}
