//! Single sink for every inbound object, whichever retrieval mode produced it.

use super::context::{Claim, SynchronizationContext};
use super::Granularity;
use crate::archive::ObjectSink;
use crate::object::ObjectReader;
use crate::storage::{FilePlacer, LocalIndex, Placement, StorageMode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one received object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// No instance id recoverable; file left where it was received.
    Unidentified,
    /// Study granularity: indexed without an expected-set check.
    Indexed { uid: String },
    Expected { uid: String },
    Duplicate { uid: String },
    Unrequested { uid: String },
}

pub struct Receiver {
    context: Arc<SynchronizationContext>,
    index: Arc<dyn LocalIndex>,
    placer: Arc<dyn FilePlacer>,
    reader: Arc<dyn ObjectReader>,
    granularity: Granularity,
}

impl Receiver {
    pub fn new(
        context: Arc<SynchronizationContext>,
        index: Arc<dyn LocalIndex>,
        placer: Arc<dyn FilePlacer>,
        reader: Arc<dyn ObjectReader>,
        granularity: Granularity,
    ) -> Self {
        Self {
            context,
            index,
            placer,
            reader,
            granularity,
        }
    }

    /// Classify, place and index one fully received object.
    pub fn receive(&self, path: &Path, source: &str) -> ReceiveOutcome {
        let bytes = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        self.context.record_arrival(bytes);

        let header = match self.reader.read_header(path) {
            Ok(header) => header,
            Err(err) => {
                error!(path = %path.display(), source, error = %err, "unreadable object left unindexed");
                self.context.stats().record_unidentified();
                return ReceiveOutcome::Unidentified;
            }
        };
        let Some(uid) = header.instance_uid().map(str::to_string) else {
            error!(path = %path.display(), source, "object without instance id left unindexed");
            self.context.stats().record_unidentified();
            return ReceiveOutcome::Unidentified;
        };

        let (stored_at, mode, duplicate_copy) = self.place(path, &header.attributes, &uid);
        if duplicate_copy {
            info!(instance = %uid, path = %stored_at.display(), "conflicting copy moved to duplicates");
        } else if let Err(err) = self.index.insert(&header.attributes, &stored_at, mode) {
            error!(instance = %uid, error = %err, "failed to index object");
            self.context.stats().record_index_failure();
        }

        if self.granularity == Granularity::Study {
            self.context.stats().record_valid();
            debug!(instance = %uid, source, "object indexed");
            return ReceiveOutcome::Indexed { uid };
        }

        match self.context.claim_instance(&uid) {
            Claim::Expected => {
                self.context.stats().record_valid();
                debug!(instance = %uid, source, "expected object received");
                ReceiveOutcome::Expected { uid }
            }
            Claim::Duplicate => {
                self.context.stats().record_duplicate();
                info!(instance = %uid, source, "object delivered more than once");
                ReceiveOutcome::Duplicate { uid }
            }
            Claim::Unrequested => {
                self.context.stats().record_unrequested();
                warn!(instance = %uid, source, "unrequested object accepted");
                ReceiveOutcome::Unrequested { uid }
            }
        }
    }

    /// Final location, storage mode, and whether the file landed in the
    /// duplicates area.
    fn place(
        &self,
        path: &Path,
        attributes: &crate::model::Attributes,
        uid: &str,
    ) -> (PathBuf, StorageMode, bool) {
        match self.placer.place(path, attributes) {
            Ok(Some(Placement::Duplicate(dest))) => (dest, StorageMode::Placed, true),
            Ok(Some(placement)) => (placement.path().to_path_buf(), StorageMode::Placed, false),
            Ok(None) => {
                warn!(instance = %uid, "no canonical path; indexing in place");
                (path.to_path_buf(), StorageMode::InPlace, false)
            }
            Err(err) => {
                warn!(instance = %uid, error = %err, "placement failed; indexing in place");
                (path.to_path_buf(), StorageMode::InPlace, false)
            }
        }
    }
}

impl ObjectSink for Receiver {
    fn on_object_received(&self, path: &Path, transfer_syntax: &str, source: &str) {
        debug!(path = %path.display(), transfer_syntax, source, "object received");
        self.receive(path, source);
    }
}
