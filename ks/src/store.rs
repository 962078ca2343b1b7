//! SQLite-backed record store

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::record::{CacheRecord, now_ms};

/// Schema version stored in `PRAGMA user_version`
///
/// Databases written with any other version are discarded on open.
pub const SCHEMA_VERSION: i32 = 1;

const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS objects (
    object_id_hash    TEXT PRIMARY KEY,
    rule_name         TEXT NOT NULL,
    input_fingerprint TEXT NOT NULL,
    dest_directory    TEXT NOT NULL,
    value             BLOB NOT NULL,
    outputs           TEXT NOT NULL,
    committed_at      INTEGER NOT NULL
);
";

/// Persistent map from object id hash to [`CacheRecord`]
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store at `path`
    ///
    /// A file that is not a readable database, or that carries a different
    /// schema version, is moved aside and replaced with an empty store. If even
    /// that fails the store falls back to memory so the caller keeps working.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "Store::open: called");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        match Self::open_file(&path) {
            Ok(store) => return Ok(store),
            Err(e) => {
                warn!(?path, error = %e, "Store::open: unreadable cache database, setting it aside");
            }
        }

        let aside = path.with_extension(format!("corrupt-{}", now_ms()));
        if let Err(e) = fs::rename(&path, &aside) {
            warn!(?path, error = %e, "Store::open: could not move corrupt database, removing it");
            let _ = fs::remove_file(&path);
        }

        match Self::open_file(&path) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(?path, error = %e, "Store::open: falling back to in-memory store");
                Self::open_in_memory()
            }
        }
    }

    /// Open a store that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        init_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    fn open_file(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open cache database")?;
        init_schema(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Path of the backing file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Fetch the record for `key`
    ///
    /// A row that cannot be decoded is reported as absent.
    pub fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        debug!(%key, "Store::get: called");
        let row = self
            .conn
            .query_row(
                "SELECT object_id_hash, rule_name, input_fingerprint, dest_directory, value, outputs, committed_at
                 FROM objects WHERE object_id_hash = ?1",
                params![key],
                |row| {
                    Ok(RawRow {
                        object_id_hash: row.get(0)?,
                        rule_name: row.get(1)?,
                        input_fingerprint: row.get(2)?,
                        dest_directory: row.get(3)?,
                        value: row.get(4)?,
                        outputs: row.get(5)?,
                        committed_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query cache record")?;

        match row {
            Some(raw) => match raw.into_record() {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(%key, error = %e, "Store::get: undecodable row, treating as absent");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Insert or replace the record for `record.object_id_hash`
    pub fn put(&mut self, record: &CacheRecord) -> Result<()> {
        debug!(key = %record.object_id_hash, rule = %record.rule_name, "Store::put: called");
        let outputs = serde_json::to_string(&record.outputs).context("Failed to encode outputs")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO objects
                 (object_id_hash, rule_name, input_fingerprint, dest_directory, value, outputs, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.object_id_hash,
                    record.rule_name,
                    record.input_fingerprint,
                    record.dest_directory.to_string_lossy(),
                    record.value,
                    outputs,
                    record.committed_at,
                ],
            )
            .context("Failed to write cache record")?;
        Ok(())
    }

    /// Remove the record for `key`, returning whether one existed
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        debug!(%key, "Store::remove: called");
        let n = self
            .conn
            .execute("DELETE FROM objects WHERE object_id_hash = ?1", params![key])
            .context("Failed to delete cache record")?;
        Ok(n > 0)
    }

    /// Number of records
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))
            .context("Failed to count cache records")?;
        Ok(n as u64)
    }
}

struct RawRow {
    object_id_hash: String,
    rule_name: String,
    input_fingerprint: String,
    dest_directory: String,
    value: Vec<u8>,
    outputs: String,
    committed_at: i64,
}

impl RawRow {
    fn into_record(self) -> Result<CacheRecord> {
        let outputs: Vec<PathBuf> = serde_json::from_str(&self.outputs).context("Failed to decode outputs")?;
        Ok(CacheRecord {
            object_id_hash: self.object_id_hash,
            rule_name: self.rule_name,
            input_fingerprint: self.input_fingerprint,
            dest_directory: PathBuf::from(self.dest_directory),
            value: self.value,
            outputs,
            committed_at: self.committed_at,
        })
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("Failed to read schema version")?;
    debug!(version, expected = SCHEMA_VERSION, "init_schema: found schema version");

    if version != SCHEMA_VERSION {
        if version != 0 {
            warn!(version, expected = SCHEMA_VERSION, "init_schema: incompatible schema, discarding records");
        }
        conn.execute_batch("DROP TABLE IF EXISTS objects;")
            .context("Failed to drop old schema")?;
    }

    conn.execute_batch(CREATE_SCHEMA).context("Failed to create schema")?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("Failed to write schema version")?;
    Ok(())
}
