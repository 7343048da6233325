//! Object hierarchy model shared by the walker, dispatcher and receiver.
//!
//! - `HierarchyLevel`: the four containment levels and their static properties
//! - `QueryNode`: one node of a remote query result tree
//! - `RetrievalRequest`: one subtree retrieval built by the walker
//! - `sop_classes`: storage-class universe and modality hints

pub mod sop_classes;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Attribute map keyed by attribute keyword.
pub type Attributes = BTreeMap<String, String>;

/// Attribute keywords the engine reads or writes.
pub mod attr {
    pub const QUERY_RETRIEVE_LEVEL: &str = "QueryRetrieveLevel";
    pub const PATIENT_NAME: &str = "PatientName";
    pub const PATIENT_ID: &str = "PatientID";
    pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
    pub const SERIES_INSTANCE_UID: &str = "SeriesInstanceUID";
    pub const SOP_INSTANCE_UID: &str = "SOPInstanceUID";
    pub const SOP_CLASS_UID: &str = "SOPClassUID";
    pub const MODALITY: &str = "Modality";
    pub const SOP_CLASSES_IN_STUDY: &str = "SOPClassesInStudy";
}

/// Separator between values of a multi-valued attribute.
pub const VALUE_SEPARATOR: char = '\\';

/// Containment rank, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HierarchyLevel {
    #[serde(rename = "PATIENT")]
    Collection,
    #[serde(rename = "STUDY")]
    Study,
    #[serde(rename = "SERIES")]
    Series,
    #[serde(rename = "IMAGE")]
    Instance,
}

struct LevelInfo {
    parent: Option<HierarchyLevel>,
    child: Option<HierarchyLevel>,
    scope_name: &'static str,
    uid_attribute: &'static str,
}

// Indexed by discriminant.
const LEVEL_TABLE: [LevelInfo; 4] = [
    LevelInfo {
        parent: None,
        child: Some(HierarchyLevel::Study),
        scope_name: "PATIENT",
        uid_attribute: attr::PATIENT_ID,
    },
    LevelInfo {
        parent: Some(HierarchyLevel::Collection),
        child: Some(HierarchyLevel::Series),
        scope_name: "STUDY",
        uid_attribute: attr::STUDY_INSTANCE_UID,
    },
    LevelInfo {
        parent: Some(HierarchyLevel::Study),
        child: Some(HierarchyLevel::Instance),
        scope_name: "SERIES",
        uid_attribute: attr::SERIES_INSTANCE_UID,
    },
    LevelInfo {
        parent: Some(HierarchyLevel::Series),
        child: None,
        scope_name: "IMAGE",
        uid_attribute: attr::SOP_INSTANCE_UID,
    },
];

impl HierarchyLevel {
    pub const ALL: [HierarchyLevel; 4] = [
        HierarchyLevel::Collection,
        HierarchyLevel::Study,
        HierarchyLevel::Series,
        HierarchyLevel::Instance,
    ];

    fn info(self) -> &'static LevelInfo {
        &LEVEL_TABLE[self as usize]
    }

    pub fn parent(self) -> Option<Self> {
        self.info().parent
    }

    pub fn child(self) -> Option<Self> {
        self.info().child
    }

    /// Query/retrieve scope name used on the wire and in the local index.
    pub fn scope_name(self) -> &'static str {
        self.info().scope_name
    }

    /// Attribute keyword carrying this level's unique id.
    pub fn uid_attribute(self) -> &'static str {
        self.info().uid_attribute
    }

    pub fn from_scope_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| level.scope_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scope_name())
    }
}

/// Identity of one entity: its level plus its unique id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueKey {
    pub level: HierarchyLevel,
    pub id: String,
}

impl UniqueKey {
    pub fn new(level: HierarchyLevel, id: impl Into<String>) -> Self {
        Self {
            level,
            id: id.into(),
        }
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.id)
    }
}

/// One node of a remote query result, with its matched children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryNode {
    pub level: HierarchyLevel,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub children: Vec<QueryNode>,
}

impl QueryNode {
    pub fn new(level: HierarchyLevel, attributes: Attributes) -> Self {
        Self {
            level,
            attributes,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<QueryNode>) -> Self {
        self.children = children;
        self
    }

    /// Trimmed, non-empty attribute value.
    pub fn attribute(&self, keyword: &str) -> Option<&str> {
        attribute_value(&self.attributes, keyword)
    }

    /// Values of a multi-valued attribute, blanks dropped.
    pub fn values(&self, keyword: &str) -> Vec<&str> {
        self.attribute(keyword)
            .map(|raw| {
                raw.split(VALUE_SEPARATOR)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The node's identity, or `None` when its unique id is absent.
    pub fn unique_key(&self) -> Option<UniqueKey> {
        self.attribute(self.level.uid_attribute())
            .map(|id| UniqueKey::new(self.level, id))
    }
}

/// Trimmed, non-empty value lookup shared by nodes and object headers.
pub fn attribute_value<'a>(attributes: &'a Attributes, keyword: &str) -> Option<&'a str> {
    attributes
        .get(keyword)
        .map(|value| value.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .filter(|value| !value.is_empty())
}

/// One subtree retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalRequest {
    pub level: HierarchyLevel,
    /// Ancestor-to-self key chain.
    pub keys: Vec<UniqueKey>,
    /// Negotiated storage classes (pull only).
    pub classes: BTreeSet<String>,
}

impl RetrievalRequest {
    pub fn new(level: HierarchyLevel, keys: Vec<UniqueKey>) -> Self {
        Self {
            level,
            keys,
            classes: BTreeSet::new(),
        }
    }

    pub fn with_classes(mut self, classes: BTreeSet<String>) -> Self {
        self.classes = classes;
        self
    }

    /// Key of the subtree root this request targets.
    pub fn target(&self) -> Option<&UniqueKey> {
        self.keys.last()
    }

    /// Identifier attributes sent with a retrieve command.
    pub fn identifiers(&self) -> Attributes {
        let mut identifiers = Attributes::new();
        identifiers.insert(
            attr::QUERY_RETRIEVE_LEVEL.to_string(),
            self.level.scope_name().to_string(),
        );
        for key in &self.keys {
            identifiers.insert(key.level.uid_attribute().to_string(), key.id.clone());
        }
        identifiers
    }
}
