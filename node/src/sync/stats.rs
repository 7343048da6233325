//! Run-level statistics aggregation.

use crate::metrics::rate_per_sec;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RunStatistics {
    started_at: Instant,
    received: AtomicU64,
    valid: AtomicU64,
    unrequested: AtomicU64,
    duplicates: AtomicU64,
    unidentified: AtomicU64,
    index_failures: AtomicU64,
    requests_dispatched: AtomicU64,
    requests_failed: AtomicU64,
    queries_failed: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStatistics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            received: AtomicU64::new(0),
            valid: AtomicU64::new(0),
            unrequested: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            unidentified: AtomicU64::new(0),
            index_failures: AtomicU64::new(0),
            requests_dispatched: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            queries_failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self, bytes: u64) {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.bytes_received.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn record_valid(&self) {
        self.valid.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_unrequested(&self) {
        self.unrequested.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_unidentified(&self) {
        self.unidentified.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_index_failure(&self) {
        self.index_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_request(&self, succeeded: bool) {
        self.requests_dispatched.fetch_add(1, Ordering::SeqCst);
        if !succeeded {
            self.requests_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_query_failure(&self) {
        self.queries_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn valid(&self) -> u64 {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn unrequested(&self) -> u64 {
        self.unrequested.load(Ordering::SeqCst)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::SeqCst)
    }

    pub fn requests_dispatched(&self) -> u64 {
        self.requests_dispatched.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Snapshot of every counter, with `outstanding` ids that never arrived.
    pub fn summary(&self, outstanding: Vec<String>) -> RunSummary {
        let elapsed = self.elapsed();
        let received = self.received();
        let bytes_received = self.bytes_received.load(Ordering::SeqCst);
        RunSummary {
            totals: TotalsSummary {
                received,
                valid: self.valid(),
                unrequested: self.unrequested(),
                duplicates: self.duplicates(),
                unidentified: self.unidentified.load(Ordering::SeqCst),
                index_failures: self.index_failures.load(Ordering::SeqCst),
                outstanding: outstanding.len() as u64,
            },
            requests: RequestSummary {
                dispatched: self.requests_dispatched(),
                failed: self.requests_failed.load(Ordering::SeqCst),
                queries_failed: self.queries_failed.load(Ordering::SeqCst),
            },
            performance: PerformanceSummary {
                elapsed_ms: elapsed.as_millis() as u64,
                bytes_received,
                objects_per_sec_avg: rate_per_sec(received, elapsed),
                bytes_per_sec_avg: rate_per_sec(bytes_received, elapsed),
            },
            outstanding,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub totals: TotalsSummary,
    pub requests: RequestSummary,
    pub performance: PerformanceSummary,
    pub outstanding: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalsSummary {
    pub received: u64,
    pub valid: u64,
    pub unrequested: u64,
    pub duplicates: u64,
    pub unidentified: u64,
    pub index_failures: u64,
    pub outstanding: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub dispatched: u64,
    pub failed: u64,
    pub queries_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub elapsed_ms: u64,
    pub bytes_received: u64,
    pub objects_per_sec_avg: Option<f64>,
    pub bytes_per_sec_avg: Option<f64>,
}
