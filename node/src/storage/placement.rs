//! Relocation of received files into the save-folder hierarchy.

use super::hash::file_sha256;
use crate::model::{attr, attribute_value, Attributes};
use eyre::{Result, WrapErr};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const OBJECT_EXTENSION: &str = "dcm";
const UNKNOWN_COLLECTION: &str = "UNKNOWN";

/// Where a received file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Moved to its canonical path.
    Stored(PathBuf),
    /// Canonical file already held identical content; the incoming copy was dropped.
    AlreadyPresent(PathBuf),
    /// Canonical file held different content; the incoming copy went to the duplicates area.
    Duplicate(PathBuf),
}

impl Placement {
    pub fn path(&self) -> &Path {
        match self {
            Placement::Stored(path) | Placement::AlreadyPresent(path) | Placement::Duplicate(path) => {
                path
            }
        }
    }
}

pub trait FilePlacer: Send + Sync {
    /// Relocate `file` according to its identifying attributes.
    ///
    /// Returns `None` when the attributes cannot name a canonical path.
    fn place(&self, file: &Path, attributes: &Attributes) -> Result<Option<Placement>>;
}

/// Places objects under `<root>/<collection>/<study>/<series>/<instance>.dcm`.
#[derive(Debug, Clone)]
pub struct HierarchyPlacer {
    root: PathBuf,
    duplicates_dir: String,
}

impl HierarchyPlacer {
    pub fn new(root: impl Into<PathBuf>, duplicates_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            duplicates_dir: duplicates_dir.into(),
        }
    }

    fn canonical_path(&self, attributes: &Attributes) -> Option<PathBuf> {
        let study = attribute_value(attributes, attr::STUDY_INSTANCE_UID)?;
        let series = attribute_value(attributes, attr::SERIES_INSTANCE_UID)?;
        let instance = attribute_value(attributes, attr::SOP_INSTANCE_UID)?;
        let collection = attribute_value(attributes, attr::PATIENT_ID).unwrap_or(UNKNOWN_COLLECTION);
        Some(
            self.root
                .join(sanitize_component(collection))
                .join(sanitize_component(study))
                .join(sanitize_component(series))
                .join(format!("{}.{OBJECT_EXTENSION}", sanitize_component(instance))),
        )
    }

    fn duplicates_dir(&self, attributes: &Attributes) -> Option<(PathBuf, String)> {
        let study = attribute_value(attributes, attr::STUDY_INSTANCE_UID)?;
        let series = attribute_value(attributes, attr::SERIES_INSTANCE_UID)?;
        let instance = sanitize_component(attribute_value(attributes, attr::SOP_INSTANCE_UID)?);
        let dir = self
            .root
            .join(&self.duplicates_dir)
            .join(sanitize_component(study))
            .join(sanitize_component(series));
        Some((dir, instance))
    }
}

impl FilePlacer for HierarchyPlacer {
    fn place(&self, file: &Path, attributes: &Attributes) -> Result<Option<Placement>> {
        let Some(target) = self.canonical_path(attributes) else {
            return Ok(None);
        };
        if target == file {
            return Ok(Some(Placement::AlreadyPresent(target)));
        }
        if claim_path(file, &target)? {
            return Ok(Some(Placement::Stored(target)));
        }

        // Another delivery owns the canonical path.
        if file_sha256(&target)? == file_sha256(file)? {
            fs::remove_file(file)
                .wrap_err_with(|| format!("failed to drop redundant copy {}", file.display()))?;
            debug!(path = %target.display(), "identical object already stored");
            return Ok(Some(Placement::AlreadyPresent(target)));
        }
        let Some((dir, instance)) = self.duplicates_dir(attributes) else {
            return Ok(None);
        };
        for n in 1u32.. {
            let candidate = dir.join(format!("{instance}.{n}.{OBJECT_EXTENSION}"));
            if claim_path(file, &candidate)? {
                return Ok(Some(Placement::Duplicate(candidate)));
            }
        }
        Ok(None)
    }
}

/// Move `from` to `to` only if `to` does not exist yet. Returns false when the
/// destination is already taken; the source is left untouched in that case.
///
/// The existence check and the move are one step: a hard link fails with
/// `AlreadyExists` instead of replacing the destination.
fn claim_path(from: &Path, to: &Path) -> Result<bool> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }
    match fs::hard_link(from, to) {
        Ok(()) => {
            fs::remove_file(from)
                .wrap_err_with(|| format!("failed to remove {}", from.display()))?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        // Cross-device or no hard-link support.
        Err(_) => copy_exclusive(from, to),
    }
}

fn copy_exclusive(from: &Path, to: &Path) -> Result<bool> {
    let mut source = fs::File::open(from)
        .wrap_err_with(|| format!("failed to open {}", from.display()))?;
    let mut dest = match OpenOptions::new().write(true).create_new(true).open(to) {
        Ok(dest) => dest,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => {
            return Err(err).wrap_err_with(|| format!("failed to create {}", to.display()))
        }
    };
    if let Err(err) = io::copy(&mut source, &mut dest).and_then(|_| dest.sync_all()) {
        let _ = fs::remove_file(to);
        return Err(err).wrap_err_with(|| {
            format!("failed to copy {} to {}", from.display(), to.display())
        });
    }
    fs::remove_file(from).wrap_err_with(|| format!("failed to remove {}", from.display()))?;
    Ok(true)
}

fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
