//! Top-level driver for one synchronization run.

use crate::archive::{ObjectSink, QueryFilter, RemoteArchive};
use crate::model::HierarchyLevel;
use crate::storage::LocalIndex;
use crate::sync::{
    Granularity, QuiescenceConfig, QuiescenceMonitor, QuiescenceReport, RetrievalDispatcher,
    RetrievalMode, RunSummary, SynchronizationContext, TreeWalker, WalkReport,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
pub struct SessionSettings {
    pub mode: RetrievalMode,
    pub granularity: Granularity,
    /// Identity the archive pushes to.
    pub destination: String,
    pub quiescence: QuiescenceConfig,
}

/// Outcome of one filter pattern.
#[derive(Debug, Clone, Serialize)]
pub struct PatternReport {
    pub pattern: String,
    pub matched: usize,
    pub walk: WalkReport,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub patterns: Vec<PatternReport>,
    pub walk: WalkReport,
    pub quiescence: QuiescenceReport,
    pub summary: RunSummary,
}

pub struct SessionController {
    archive: Arc<dyn RemoteArchive>,
    index: Arc<dyn LocalIndex>,
    context: Arc<SynchronizationContext>,
    dispatcher: RetrievalDispatcher,
    settings: SessionSettings,
}

impl SessionController {
    pub fn new(
        archive: Arc<dyn RemoteArchive>,
        index: Arc<dyn LocalIndex>,
        context: Arc<SynchronizationContext>,
        sink: Arc<dyn ObjectSink>,
        settings: SessionSettings,
    ) -> Self {
        let dispatcher = RetrievalDispatcher::new(
            Arc::clone(&archive),
            Arc::clone(&context),
            sink,
            settings.mode,
            settings.destination.clone(),
        );
        Self {
            archive,
            index,
            context,
            dispatcher,
            settings,
        }
    }

    fn query_depth(&self) -> HierarchyLevel {
        match self.settings.granularity {
            Granularity::Study => HierarchyLevel::Study,
            Granularity::Instance => HierarchyLevel::Instance,
        }
    }

    /// Query and walk every pattern, then wait once for the run to settle.
    ///
    /// Never fails: a failed query abandons only its own pattern.
    pub fn run(&self, patterns: &[String]) -> SessionReport {
        let walker = TreeWalker::new(
            self.index.as_ref(),
            self.context.as_ref(),
            &self.dispatcher,
            self.settings.mode,
        );
        let depth = self.query_depth();
        let mut total = WalkReport::default();
        let mut reports = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let filter = QueryFilter::for_name_pattern(pattern, depth);
            let roots = match self.archive.find(&filter) {
                Ok(roots) => roots,
                Err(err) => {
                    error!(pattern = %pattern, error = %err, "query failed; skipping pattern");
                    self.context.stats().record_query_failure();
                    reports.push(PatternReport {
                        pattern: pattern.clone(),
                        matched: 0,
                        walk: WalkReport::default(),
                        error: Some(format!("{err:#}")),
                    });
                    continue;
                }
            };
            let walk = walker.walk_tree(&roots);
            info!(
                pattern = %pattern,
                matched = roots.len(),
                requests = walk.requests,
                expected = walk.expected_instances,
                skipped = walk.skipped,
                "pattern walked"
            );
            total.absorb(&walk);
            reports.push(PatternReport {
                pattern: pattern.clone(),
                matched: roots.len(),
                walk,
                error: None,
            });
        }

        let mut quiescence = self.settings.quiescence;
        // Study-level pushes never populate the expected set; only silence
        // tells us the archive is done.
        quiescence.require_idle |= self.settings.mode == RetrievalMode::Push
            && self.settings.granularity == Granularity::Study
            && total.requests > 0;
        let settled = QuiescenceMonitor::new(self.context.as_ref(), quiescence).run();
        let summary = self.context.stats().summary(self.context.outstanding());
        info!(
            received = summary.totals.received,
            valid = summary.totals.valid,
            unrequested = summary.totals.unrequested,
            duplicates = summary.totals.duplicates,
            outstanding = summary.totals.outstanding,
            requests = summary.requests.dispatched,
            elapsed_ms = summary.performance.elapsed_ms,
            "synchronization finished"
        );

        SessionReport {
            patterns: reports,
            walk: total,
            quiescence: settled,
            summary,
        }
    }
}
