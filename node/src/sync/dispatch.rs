//! One retrieval per missing subtree, by push or by pull.

use super::context::SynchronizationContext;
use super::walker::SubtreeRetriever;
use super::RetrievalMode;
use crate::archive::{ObjectSink, RemoteArchive, RetrieveOutcome};
use crate::metrics::rate_per_sec;
use crate::model::{sop_classes, RetrievalRequest};
use eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RetrievalDispatcher {
    archive: Arc<dyn RemoteArchive>,
    context: Arc<SynchronizationContext>,
    sink: Arc<dyn ObjectSink>,
    mode: RetrievalMode,
    /// Push destination identity, known to the remote archive.
    destination: String,
}

impl RetrievalDispatcher {
    pub fn new(
        archive: Arc<dyn RemoteArchive>,
        context: Arc<SynchronizationContext>,
        sink: Arc<dyn ObjectSink>,
        mode: RetrievalMode,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            archive,
            context,
            sink,
            mode,
            destination: destination.into(),
        }
    }

    /// Returns once the archive acknowledged the command; objects arrive
    /// through the listener.
    fn push(&self, request: &RetrievalRequest) -> Result<RetrieveOutcome> {
        self.archive.move_to(request, &self.destination)
    }

    /// Blocks for the whole transfer, driving the sink for every object.
    fn pull(&self, request: &RetrievalRequest) -> Result<RetrieveOutcome> {
        let mut classes = self.context.expected_classes();
        if classes.is_empty() {
            classes = sop_classes::universe();
        }
        let request = request.clone().with_classes(classes);
        let result = self
            .archive
            .get(&request, &request.classes, self.sink.as_ref());
        self.context.clear_expected_classes();
        result
    }
}

impl SubtreeRetriever for RetrievalDispatcher {
    fn retrieve(&self, request: &RetrievalRequest) -> Result<RetrieveOutcome> {
        self.context.reset_transfer_window();
        let outcome = match self.mode {
            RetrievalMode::Push => self.push(request),
            RetrievalMode::Pull => self.pull(request),
        }?;

        let subtree = request
            .target()
            .map(ToString::to_string)
            .unwrap_or_default();
        let (bytes, elapsed) = self.context.transfer_window();
        if outcome.is_warning() {
            warn!(
                subtree = %subtree,
                status = outcome.status,
                failed = outcome.failed,
                warning = outcome.warning,
                "retrieval completed with warnings"
            );
        } else if !outcome.is_success() {
            warn!(
                subtree = %subtree,
                status = outcome.status,
                completed = outcome.completed,
                failed = outcome.failed,
                "retrieval failed"
            );
        }
        info!(
            subtree = %subtree,
            completed = outcome.completed,
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            bytes_per_sec = rate_per_sec(bytes, elapsed).unwrap_or_default(),
            "retrieval finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HierarchyLevel, UniqueKey};
    use crate::test_utils::{FakeArchive, RecordingSink};
    use std::collections::BTreeSet;

    fn request() -> RetrievalRequest {
        RetrievalRequest::new(
            HierarchyLevel::Study,
            vec![UniqueKey::new(HierarchyLevel::Study, "1.2.3")],
        )
    }

    #[test]
    fn push_sends_move_to_destination() {
        let archive = Arc::new(FakeArchive::new(Vec::new()));
        let context = Arc::new(SynchronizationContext::new());
        let dispatcher = RetrievalDispatcher::new(
            archive.clone(),
            context,
            Arc::new(RecordingSink::default()),
            RetrievalMode::Push,
            "SYNC",
        );
        let outcome = dispatcher.retrieve(&request()).expect("move");
        assert!(outcome.is_success());

        let moves = archive.moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].1, "SYNC");
        assert!(archive.gets().is_empty());
    }

    #[test]
    fn pull_negotiates_expected_classes_then_clears_them() {
        let archive = Arc::new(FakeArchive::new(Vec::new()));
        let context = Arc::new(SynchronizationContext::new());
        context.add_expected_classes([sop_classes::CT_IMAGE.to_string()]);
        let dispatcher = RetrievalDispatcher::new(
            archive.clone(),
            context.clone(),
            Arc::new(RecordingSink::default()),
            RetrievalMode::Pull,
            "SYNC",
        );
        dispatcher.retrieve(&request()).expect("get");
        dispatcher.retrieve(&request()).expect("get");

        let gets = archive.gets();
        assert_eq!(
            gets[0].classes,
            BTreeSet::from([sop_classes::CT_IMAGE.to_string()])
        );
        // Nothing expected for the second subtree: fall back to every class.
        assert_eq!(gets[1].classes, sop_classes::universe());
        assert!(context.expected_classes().is_empty());
    }
}
