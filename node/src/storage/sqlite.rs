//! SQLite-backed local index.

use super::{indexed_attributes, records_for, IndexRecord, LocalIndex, StorageMode};
use crate::model::{Attributes, HierarchyLevel};
use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const SCHEMA_VERSION: i64 = 1;
const IN_MEMORY: &str = ":memory:";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    level        TEXT NOT NULL,
    uid          TEXT NOT NULL,
    parent_uid   TEXT,
    path         TEXT,
    storage_mode TEXT,
    attributes   TEXT NOT NULL,
    indexed_at   INTEGER NOT NULL,
    PRIMARY KEY (level, uid)
);
CREATE INDEX IF NOT EXISTS entities_parent ON entities (parent_uid);
";

#[derive(Debug)]
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl SqliteIndex {
    /// Open (or create) the index at `path`; `:memory:` opens a transient index.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == IN_MEMORY {
            return Self::in_memory();
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create index directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to open local index {}", path.display()))?;
        let index = Self::from_connection(conn)?;
        info!(path = %path.display(), "local index opened");
        Ok(index)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().wrap_err("failed to open in-memory index")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(eyre!(
                "local index schema version {version} is newer than supported {SCHEMA_VERSION}"
            ));
        }
        conn.execute_batch(SCHEMA)
            .wrap_err("failed to apply local index schema")?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of indexed entities at `level`.
    pub fn count(&self, level: HierarchyLevel) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE level = ?1",
            params![level.scope_name()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Stored attributes of one entity.
    #[cfg(test)]
    pub fn attributes(&self, level: HierarchyLevel, uid: &str) -> Result<Option<Attributes>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT attributes FROM entities WHERE level = ?1 AND uid = ?2",
                params![level.scope_name(), uid],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).wrap_err("corrupt attributes column"))
            .transpose()
    }
}

impl LocalIndex for SqliteIndex {
    fn lookup(&self, level: HierarchyLevel, uid: &str) -> Result<Vec<IndexRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT parent_uid, path, storage_mode FROM entities WHERE level = ?1 AND uid = ?2",
        )?;
        let rows = stmt.query_map(params![level.scope_name(), uid], |row| {
            let parent_uid: Option<String> = row.get(0)?;
            let path: Option<String> = row.get(1)?;
            let storage_mode: Option<String> = row.get(2)?;
            Ok(IndexRecord {
                level,
                uid: uid.to_string(),
                parent_uid,
                path: path.map(PathBuf::from),
                storage_mode: storage_mode.as_deref().and_then(StorageMode::parse),
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn insert(&self, attributes: &Attributes, path: &Path, mode: StorageMode) -> Result<()> {
        let records = records_for(attributes, path, mode);
        if records.is_empty() {
            return Err(eyre!("object carries no identifying attributes"));
        }
        let stored = serde_json::to_string(&indexed_attributes(attributes))?;
        let indexed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in &records {
            tx.execute(
                "INSERT INTO entities (level, uid, parent_uid, path, storage_mode, attributes, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (level, uid) DO UPDATE SET
                     parent_uid = COALESCE(excluded.parent_uid, entities.parent_uid),
                     path = COALESCE(excluded.path, entities.path),
                     storage_mode = COALESCE(excluded.storage_mode, entities.storage_mode),
                     attributes = excluded.attributes,
                     indexed_at = excluded.indexed_at",
                params![
                    record.level.scope_name(),
                    record.uid,
                    record.parent_uid,
                    record.path.as_ref().map(|p| p.to_string_lossy().to_string()),
                    record.storage_mode.map(StorageMode::as_str),
                    stored,
                    indexed_at,
                ],
            )?;
        }
        tx.commit().wrap_err("failed to commit index insert")?;
        debug!(
            levels = records.len(),
            path = %path.display(),
            "object indexed"
        );
        Ok(())
    }
}
