//! Remote archive seam.
//!
//! - `RemoteArchive`: find / move / get against the remote archive
//! - `ObjectSink`: callback invoked once per fully received object
//! - `gateway`: blocking client for the archive gateway protocol
//! - `listener`: async push listener that receives remote-initiated deliveries
//! - `wire`: newline-delimited JSON frames shared by both

mod gateway;
mod listener;
mod wire;

pub use gateway::{GatewayArchive, GatewayConfig};
pub use listener::{spawn_listener, ListenerConfig};

use crate::model::{attr, Attributes, HierarchyLevel, QueryNode, RetrievalRequest};
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod transfer_syntax {
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
    pub const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";
    pub const JPEG_LS_LOSSLESS: &str = "1.2.840.10008.1.2.4.80";
    pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
    pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
    pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";

    pub const UNCOMPRESSED: &[&str] = &[
        EXPLICIT_VR_LITTLE_ENDIAN,
        IMPLICIT_VR_LITTLE_ENDIAN,
        EXPLICIT_VR_BIG_ENDIAN,
    ];

    pub const COMPRESSED: &[&str] = &[
        DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
        JPEG_BASELINE,
        JPEG_LOSSLESS_SV1,
        JPEG_LS_LOSSLESS,
        JPEG_2000_LOSSLESS,
        JPEG_2000,
        RLE_LOSSLESS,
    ];
}

/// Which transfer syntaxes are acceptable for received objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferSyntaxPolicy {
    Uncompressed,
    Any,
}

impl TransferSyntaxPolicy {
    pub fn accepts(self, uid: &str) -> bool {
        match self {
            TransferSyntaxPolicy::Uncompressed => transfer_syntax::UNCOMPRESSED.contains(&uid.trim()),
            TransferSyntaxPolicy::Any => true,
        }
    }

    /// Syntaxes offered during negotiation, most preferred first.
    pub fn proposed(self) -> Vec<String> {
        let mut proposed: Vec<String> = transfer_syntax::UNCOMPRESSED
            .iter()
            .map(|uid| uid.to_string())
            .collect();
        if self == TransferSyntaxPolicy::Any {
            proposed.extend(transfer_syntax::COMPRESSED.iter().map(|uid| uid.to_string()));
        }
        proposed
    }
}

/// Scope of one hierarchical query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Deepest level the matching tree should be expanded to.
    pub depth: HierarchyLevel,
    pub attributes: Attributes,
}

impl QueryFilter {
    /// Study-rooted query matching collection names against `pattern`.
    pub fn for_name_pattern(pattern: &str, depth: HierarchyLevel) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(attr::PATIENT_NAME.to_string(), pattern.to_string());
        Self { depth, attributes }
    }
}

/// Final status of a retrieve command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveOutcome {
    pub status: u16,
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
}

impl RetrieveOutcome {
    pub const SUCCESS: u16 = 0x0000;

    pub fn success(completed: u32) -> Self {
        Self {
            status: Self::SUCCESS,
            completed,
            ..Self::default()
        }
    }

    pub fn is_warning(&self) -> bool {
        (0xB000..=0xBFFF).contains(&self.status)
    }

    /// Success or warning; anything else is a failed retrieval.
    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS || self.is_warning()
    }
}

/// Receives fully transferred objects, whichever retrieval mode produced them.
pub trait ObjectSink: Send + Sync {
    fn on_object_received(&self, path: &Path, transfer_syntax: &str, source: &str);
}

/// Query/retrieve operations against the remote archive.
pub trait RemoteArchive: Send + Sync {
    /// Matching tree for `filter`, rooted at study nodes.
    fn find(&self, filter: &QueryFilter) -> Result<Vec<QueryNode>>;

    /// Ask the archive to push `request`'s subtree to `destination`.
    ///
    /// Returns once the archive has answered the command; objects arrive
    /// separately through the push listener.
    fn move_to(&self, request: &RetrievalRequest, destination: &str) -> Result<RetrieveOutcome>;

    /// Stream `request`'s subtree back over the same association, handing each
    /// object to `sink` as it completes.
    fn get(
        &self,
        request: &RetrievalRequest,
        classes: &BTreeSet<String>,
        sink: &dyn ObjectSink,
    ) -> Result<RetrieveOutcome>;
}

/// Unique scratch path for an object being received into `dir`.
pub fn incoming_path(dir: &Path, prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{prefix}-{}-{nanos}-{seq}.part", std::process::id()))
}
