//! Run orchestration module.
//!
//! - `filters`: collection-name patterns that scope each query
//! - `session`: per-run driver over query, walk and quiescence
//! - `sync_runner`: process wiring from configuration to report

mod filters;
mod session;
mod sync_runner;

pub use filters::QueryScope;
pub use session::SessionReport;
pub use sync_runner::run_sync;
