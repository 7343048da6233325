//! Local index and on-disk placement of received objects.

mod hash;
mod placement;
mod sqlite;

pub use placement::{FilePlacer, HierarchyPlacer, Placement};
pub use sqlite::SqliteIndex;

use crate::model::{attr, attribute_value, Attributes, HierarchyLevel};
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How an indexed instance's file is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Moved into the save folder hierarchy.
    Placed,
    /// Left where it was received.
    InPlace,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMode::Placed => "placed",
            StorageMode::InPlace => "in_place",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "placed" => Some(StorageMode::Placed),
            "in_place" => Some(StorageMode::InPlace),
            _ => None,
        }
    }
}

/// One indexed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub level: HierarchyLevel,
    pub uid: String,
    pub parent_uid: Option<String>,
    pub path: Option<PathBuf>,
    pub storage_mode: Option<StorageMode>,
}

/// Local record of what has already been synchronized.
pub trait LocalIndex: Send + Sync {
    /// Records at `level` with unique id `uid` (zero or more).
    fn lookup(&self, level: HierarchyLevel, uid: &str) -> Result<Vec<IndexRecord>>;

    /// Index a newly arrived object, registering every level it identifies.
    fn insert(&self, attributes: &Attributes, path: &Path, mode: StorageMode) -> Result<()>;

    fn contains(&self, level: HierarchyLevel, uid: &str) -> Result<bool> {
        Ok(!self.lookup(level, uid)?.is_empty())
    }
}

/// Expand one object's attributes into per-level records, coarsest first.
///
/// Only the instance record carries the file path.
pub(crate) fn records_for(
    attributes: &Attributes,
    path: &Path,
    mode: StorageMode,
) -> Vec<IndexRecord> {
    let mut records = Vec::with_capacity(HierarchyLevel::ALL.len());
    let mut parent: Option<String> = None;
    for level in HierarchyLevel::ALL {
        let Some(uid) = attribute_value(attributes, level.uid_attribute()) else {
            continue;
        };
        let is_instance = level == HierarchyLevel::Instance;
        records.push(IndexRecord {
            level,
            uid: uid.to_string(),
            parent_uid: parent.clone(),
            path: is_instance.then(|| path.to_path_buf()),
            storage_mode: is_instance.then_some(mode),
        });
        parent = Some(uid.to_string());
    }
    records
}

/// Attribute subset persisted with each record.
pub(crate) fn indexed_attributes(attributes: &Attributes) -> Attributes {
    const KEPT: &[&str] = &[
        attr::PATIENT_NAME,
        attr::PATIENT_ID,
        attr::STUDY_INSTANCE_UID,
        attr::SERIES_INSTANCE_UID,
        attr::SOP_INSTANCE_UID,
        attr::SOP_CLASS_UID,
        attr::MODALITY,
    ];
    attributes
        .iter()
        .filter(|(keyword, _)| KEPT.contains(&keyword.as_str()))
        .map(|(keyword, value)| (keyword.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_chain_parents_and_skip_missing_levels() {
        let mut attributes = Attributes::new();
        attributes.insert(attr::STUDY_INSTANCE_UID.to_string(), "1.2.3".to_string());
        attributes.insert(attr::SERIES_INSTANCE_UID.to_string(), "1.2.3.1".to_string());
        attributes.insert(attr::SOP_INSTANCE_UID.to_string(), "1.2.3.1.1".to_string());

        let records = records_for(&attributes, Path::new("/tmp/a.dcm"), StorageMode::Placed);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].level, HierarchyLevel::Study);
        assert_eq!(records[0].parent_uid, None);
        assert_eq!(records[1].parent_uid.as_deref(), Some("1.2.3"));
        assert_eq!(records[2].parent_uid.as_deref(), Some("1.2.3.1"));
        assert_eq!(records[2].path.as_deref(), Some(Path::new("/tmp/a.dcm")));
        assert_eq!(records[2].storage_mode, Some(StorageMode::Placed));
        assert!(records[1].path.is_none());
    }

    #[test]
    fn storage_mode_round_trips_through_str() {
        for mode in [StorageMode::Placed, StorageMode::InPlace] {
            assert_eq!(StorageMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(StorageMode::parse("copied"), None);
    }
}
