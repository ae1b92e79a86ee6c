//! `SQLite` backed history of successful test runs.
//!
//! [`Engine`] owns the connection to the database file and its lifecycle.
//! [`Session`] is the transactional API over the two tables: `test_file`
//! and `test_item`. Handles returned by a session ([`TestFile`],
//! [`TestItem`]) are leased to the session scope that produced them and are
//! rejected by any other scope.

use std::fmt::{Display, Formatter};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use test_samples_core::{parse_rfc3339_utc, FileDigest, Location};
use time::OffsetDateTime;

mod engine;
mod session;

pub use engine::Engine;
pub use session::{HashProvider, Session};

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS test_file (
  id INTEGER PRIMARY KEY,
  path TEXT NOT NULL UNIQUE,
  last_hash BLOB
);

CREATE TABLE IF NOT EXISTS test_item (
  id INTEGER PRIMARY KEY,
  file_id INTEGER NOT NULL REFERENCES test_file(id),
  lineno INTEGER,
  testname TEXT NOT NULL,
  last_run TEXT NOT NULL,
  UNIQUE (file_id, lineno, testname)
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_test_item_file_testname_no_lineno
  ON test_item(file_id, testname) WHERE lineno IS NULL;
CREATE INDEX IF NOT EXISTS idx_test_item_file
  ON test_item(file_id);
";

const TEST_FILE_COLUMNS: &[&str] = &["id", "path", "last_hash"];
const TEST_ITEM_COLUMNS: &[&str] = &["id", "file_id", "lineno", "testname", "last_run"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid database path: {0}")]
    InvalidPath(String),
    #[error("the provided path is a relative path: {}", .0.display())]
    RelativePath(PathBuf),
    #[error("the database path points to a directory: {}", .0.display())]
    IsADirectory(PathBuf),
    #[error("the session object was not entered")]
    InactiveSession,
    #[error("the engine instance was already disposed")]
    EngineDisposed,
    #[error("the connection is already in use by another operation")]
    ConnectionInUse,
    #[error("the file {0:?} is not attached to the active session")]
    DetachedInstance(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("multiple results found: {0}")]
    MultipleResultsFound(String),
    #[error("no result found: {0}")]
    NoResultFound(String),
    #[error("the database is corrupted: {0}")]
    DatabaseCorruption(String),
    #[error("failed to hash test file {path}")]
    Hash {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid stored value")]
    Core(#[from] test_samples_core::CoreError),
    #[error("i/o error on the database file")]
    Io(#[from] io::Error),
    #[error("sqlite error")]
    Sqlite(#[source] rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Self::Integrity(
                    message
                        .clone()
                        .unwrap_or_else(|| failure.to_string()),
                )
            }
            _ => Self::Sqlite(err),
        }
    }
}

/// Identifies one entered session scope. Unique across all engines of the
/// process.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) struct ScopeId(u64);

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

impl ScopeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SCOPE.fetch_add(1, Ordering::Relaxed))
    }
}

/// A file containing tests, leased to the session scope that loaded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFile {
    id: i64,
    path: String,
    last_hash: Option<FileDigest>,
    scope: ScopeId,
}

impl TestFile {
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The digest recorded for the file. `None` means the file is not
    /// tracked by hash.
    #[must_use]
    pub fn last_hash(&self) -> Option<FileDigest> {
        self.last_hash
    }
}

/// A test location with a recorded successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestItem {
    id: i64,
    file_id: i64,
    lineno: Option<u32>,
    testname: String,
    last_run: OffsetDateTime,
}

impl TestItem {
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[must_use]
    pub fn file_id(&self) -> i64 {
        self.file_id
    }

    #[must_use]
    pub fn lineno(&self) -> Option<u32> {
        self.lineno
    }

    #[must_use]
    pub fn testname(&self) -> &str {
        &self.testname
    }

    #[must_use]
    pub fn last_run(&self) -> OffsetDateTime {
        self.last_run
    }
}

/// A stored item resolved to its full location, as listed by
/// [`Session::list_items`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub location: Location,
    pub last_run: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BulkUpdateResult {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// `None` when pruning was not requested.
    pub pruned_files: Option<usize>,
}

impl Display for BulkUpdateResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} added, {} updated, {} removed",
            self.added, self.updated, self.removed
        )?;
        if let Some(pruned) = self.pruned_files {
            write!(f, ", {pruned} pruned files")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DropAllEntriesResult {
    pub files_dropped: usize,
    pub tests_dropped: usize,
}

impl Display for DropAllEntriesResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} files dropped, {} tests dropped",
            self.files_dropped, self.tests_dropped
        )
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StoreCounts {
    pub files: usize,
    pub items: usize,
}

fn parse_file_row(row: &rusqlite::Row<'_>, scope: ScopeId) -> rusqlite::Result<TestFile> {
    let last_hash = row
        .get::<_, Option<Vec<u8>>>(2)?
        .map(|blob| {
            FileDigest::from_slice(&blob).ok_or_else(|| {
                conversion_error(2, format!("invalid hash width: {} bytes", blob.len()))
            })
        })
        .transpose()?;

    Ok(TestFile {
        id: row.get(0)?,
        path: row.get(1)?,
        last_hash,
        scope,
    })
}

fn parse_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestItem> {
    Ok(TestItem {
        id: row.get(0)?,
        file_id: row.get(1)?,
        lineno: parse_lineno(row, 2)?,
        testname: row.get(3)?,
        last_run: parse_timestamp(row, 4)?,
    })
}

fn parse_lineno(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Option<u32>> {
    row.get::<_, Option<i64>>(index)?
        .map(|raw| {
            u32::try_from(raw)
                .map_err(|_| conversion_error(index, format!("invalid lineno: {raw}")))
        })
        .transpose()
}

fn parse_timestamp(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| conversion_error(index, err.to_string()))
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(io::Error::new(io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Returns the only element of `rows`, `None` for no rows and
/// [`StoreError::MultipleResultsFound`] when uniqueness was violated.
fn at_most_one<T>(mut rows: Vec<T>, what: impl FnOnce() -> String) -> Result<Option<T>, StoreError> {
    if rows.len() > 1 {
        return Err(StoreError::MultipleResultsFound(what()));
    }
    Ok(rows.pop())
}

fn lineno_to_sql(lineno: Option<u32>) -> Option<i64> {
    lineno.map(i64::from)
}

fn count_to_usize(raw: i64) -> Result<usize, StoreError> {
    usize::try_from(raw)
        .map_err(|_| StoreError::DatabaseCorruption(format!("negative row count: {raw}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaCheck {
    /// Missing tables are fine; present ones must carry every column.
    ExistingOnly,
    Complete,
}

fn corruption(err: rusqlite::Error) -> StoreError {
    StoreError::DatabaseCorruption(err.to_string())
}

fn validate_schema(conn: &Connection, check: SchemaCheck) -> Result<(), StoreError> {
    for (table, columns) in [
        ("test_file", TEST_FILE_COLUMNS),
        ("test_item", TEST_ITEM_COLUMNS),
    ] {
        if !table_exists(conn, table)? {
            if check == SchemaCheck::ExistingOnly {
                continue;
            }
            return Err(StoreError::DatabaseCorruption(format!(
                "expected table {table}"
            )));
        }
        ensure_table_has_columns(conn, table, columns)?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .map_err(|err| StoreError::DatabaseCorruption(err.to_string()))?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(
    conn: &Connection,
    table_name: &str,
    columns: &[&str],
) -> Result<(), StoreError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .map_err(|err| StoreError::DatabaseCorruption(err.to_string()))?;
    let available = collect_rows(stmt.query_map([], |row| row.get::<_, String>(1))?)?;

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(StoreError::DatabaseCorruption(format!(
                "missing column {table_name}.{required}"
            )));
        }
    }

    Ok(())
}
