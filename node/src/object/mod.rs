//! Identification of received objects.

mod part10;

pub use part10::{Part10Reader, DEFAULT_HEADER_READ_BYTES};
#[cfg(test)]
pub(crate) use part10::HEADER_TAGS;

use crate::model::{attr, attribute_value, Attributes};
use eyre::Result;
use std::path::Path;

/// Identifying attributes recovered from the head of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHeader {
    pub attributes: Attributes,
    pub transfer_syntax: Option<String>,
}

impl ObjectHeader {
    pub fn instance_uid(&self) -> Option<&str> {
        attribute_value(&self.attributes, attr::SOP_INSTANCE_UID)
    }
}

/// Reads just enough of a stored object to route and index it.
pub trait ObjectReader: Send + Sync {
    fn read_header(&self, path: &Path) -> Result<ObjectHeader>;
}
