use std::collections::HashSet;
use std::io;

use rusqlite::{params, Connection};
use test_samples_core::{count_true_false, format_rfc3339, FileDigest, Location};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    at_most_one, collect_rows, count_to_usize, lineno_to_sql, parse_file_row, parse_item_row,
    parse_lineno, parse_timestamp, BulkUpdateResult, DropAllEntriesResult, Engine, ScopeId,
    StoreCounts, StoreError, StoredItem, TestFile, TestItem,
};

/// Computes the digest of a test file given its stored path. Called only
/// for files created by [`Session::bulk_add_update_remove`].
pub type HashProvider<'a> = &'a mut dyn FnMut(&str) -> io::Result<FileDigest>;

/// Transactional view of the history tables.
///
/// A session must be entered before use. Each multi-statement operation
/// runs in its own savepoint and either commits as a whole or leaves the
/// database untouched.
#[derive(Debug)]
pub struct Session<'e> {
    engine: &'e Engine,
    scope: Option<ScopeId>,
}

impl<'e> Session<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            scope: None,
        }
    }

    /// Activates the session with a fresh scope. Handles leased by an
    /// earlier scope become detached.
    ///
    /// # Errors
    /// Returns [`StoreError::EngineDisposed`] after engine disposal.
    pub fn enter(&mut self) -> Result<(), StoreError> {
        self.engine.ensure_not_disposed()?;
        self.scope = Some(ScopeId::next());
        Ok(())
    }

    pub fn exit(&mut self) {
        self.scope = None;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.scope.is_some()
    }

    /// Loads the file stored under `path`.
    ///
    /// # Errors
    /// Returns [`StoreError::MultipleResultsFound`] when the path is stored
    /// more than once, on top of the usual session errors.
    pub fn try_get_file(&self, path: &str) -> Result<Option<TestFile>, StoreError> {
        let scope = self.active_scope()?;
        self.engine
            .with_connection(|conn| query_file(conn, path, scope))
    }

    /// Stores a new file.
    ///
    /// # Errors
    /// Returns [`StoreError::Integrity`] when `path` is already stored.
    pub fn add_file(&self, path: &str, hash: Option<FileDigest>) -> Result<TestFile, StoreError> {
        let scope = self.active_scope()?;
        let file = self
            .engine
            .with_connection(|conn| insert_file(conn, path, hash, scope))?;
        debug!(path, id = file.id, "added test file");
        Ok(file)
    }

    /// Loads the item identified by `(file, lineno, testname)`.
    ///
    /// # Errors
    /// Returns [`StoreError::DetachedInstance`] when `file` was loaded by
    /// another session scope.
    pub fn try_get_item(
        &self,
        file: &TestFile,
        lineno: Option<u32>,
        testname: &str,
    ) -> Result<Option<TestItem>, StoreError> {
        self.ensure_attached(file)?;
        self.engine
            .with_connection(|conn| query_item(conn, file.id, lineno, testname))
    }

    /// Records `new_hash` on `file` and deletes all of its items. Returns
    /// the number of deleted items.
    ///
    /// # Errors
    /// Returns [`StoreError::DetachedInstance`] for a foreign handle and
    /// [`StoreError::NoResultFound`] when the file row no longer exists.
    pub fn invalidate_hash(
        &self,
        file: &mut TestFile,
        new_hash: FileDigest,
    ) -> Result<usize, StoreError> {
        self.ensure_attached(file)?;
        let deleted = self.engine.with_connection(|conn| {
            let sp = conn.savepoint()?;
            let updated = sp.execute(
                "UPDATE test_file SET last_hash = ?1 WHERE id = ?2",
                params![new_hash.as_bytes().as_slice(), file.id],
            )?;
            if updated == 0 {
                return Err(StoreError::NoResultFound(format!(
                    "test_file.id = {}",
                    file.id
                )));
            }
            let deleted = sp.execute(
                "DELETE FROM test_item WHERE file_id = ?1",
                params![file.id],
            )?;
            sp.commit()?;
            Ok(deleted)
        })?;

        file.last_hash = Some(new_hash);
        debug!(path = %file.path, deleted, "invalidated file hash");
        Ok(deleted)
    }

    /// Deletes every file that has no items. Returns the number of deleted
    /// files.
    ///
    /// # Errors
    /// Returns the usual session and `SQLite` errors.
    pub fn prune_files(&self) -> Result<usize, StoreError> {
        self.active_scope()?;
        let pruned = self.engine.with_connection(|conn| {
            let sp = conn.savepoint()?;
            let pruned = delete_files_without_items(&sp)?;
            sp.commit()?;
            Ok(pruned)
        })?;
        debug!(pruned, "pruned test files");
        Ok(pruned)
    }

    /// Deletes every stored item whose location is not in `known`. Returns
    /// the number of deleted items.
    ///
    /// # Errors
    /// Returns the usual session and `SQLite` errors.
    pub fn prune_items(&self, known: &HashSet<Location>) -> Result<usize, StoreError> {
        self.active_scope()?;
        let pruned = self.engine.with_connection(|conn| {
            let sp = conn.savepoint()?;
            let stale: Vec<i64> = {
                let mut stmt = sp.prepare(
                    "SELECT i.id, f.path, i.lineno, i.testname
                     FROM test_item AS i
                     JOIN test_file AS f ON f.id = i.file_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    let location = Location::new(
                        row.get::<_, String>(1)?,
                        parse_lineno(row, 2)?,
                        row.get::<_, String>(3)?,
                    );
                    Ok((row.get::<_, i64>(0)?, location))
                })?;
                collect_rows(rows)?
                    .into_iter()
                    .filter(|(_, location)| !known.contains(location))
                    .map(|(id, _)| id)
                    .collect()
            };

            {
                let mut delete = sp.prepare("DELETE FROM test_item WHERE id = ?1")?;
                for id in &stale {
                    delete.execute(params![id])?;
                }
            }
            sp.commit()?;
            Ok(stale.len())
        })?;
        debug!(pruned, "pruned test items");
        Ok(pruned)
    }

    /// Records a successful run of `(file, lineno, testname)` at
    /// `last_run`, creating the item if needed.
    ///
    /// # Errors
    /// Returns [`StoreError::DetachedInstance`] for a foreign handle.
    pub fn add_or_update_item(
        &self,
        file: &TestFile,
        lineno: Option<u32>,
        testname: &str,
        last_run: OffsetDateTime,
    ) -> Result<TestItem, StoreError> {
        self.ensure_attached(file)?;
        let stamp = format_rfc3339(last_run)?;
        self.engine.with_connection(|conn| {
            let sp = conn.savepoint()?;
            upsert_item(&sp, file.id, lineno, testname, &stamp)?;
            let item = query_item(&sp, file.id, lineno, testname)?.ok_or_else(|| {
                StoreError::NoResultFound(format!("test_item {testname} in file {}", file.id))
            })?;
            sp.commit()?;
            Ok(item)
        })
    }

    /// Deletes the item at `location`. Returns whether an item was deleted.
    ///
    /// # Errors
    /// Returns [`StoreError::MultipleResultsFound`] when more than one row
    /// matched, in which case nothing is deleted.
    pub fn try_delete_item(&self, location: &Location) -> Result<bool, StoreError> {
        let scope = self.active_scope()?;
        let deleted = self.engine.with_connection(|conn| {
            let sp = conn.savepoint()?;
            let deleted = delete_item(&sp, location, scope)?;
            sp.commit()?;
            Ok(deleted)
        })?;
        debug!(%location, deleted, "deleted test item");
        Ok(deleted)
    }

    /// Applies a whole run in one transaction: records `add_update` at
    /// `last_run`, deletes `try_delete` and optionally prunes files without
    /// items.
    ///
    /// `hash_provider` is consulted once for every file created on the way.
    /// Without a provider new files are stored untracked.
    ///
    /// # Errors
    /// Returns [`StoreError::Hash`] when hashing a new file fails, or
    /// [`StoreError::MultipleResultsFound`] on duplicated rows. Nothing is
    /// written in either case.
    pub fn bulk_add_update_remove<'a, A, D>(
        &self,
        last_run: OffsetDateTime,
        add_update: A,
        try_delete: D,
        mut hash_provider: Option<HashProvider<'_>>,
        prune_files: bool,
    ) -> Result<BulkUpdateResult, StoreError>
    where
        A: IntoIterator<Item = &'a Location>,
        D: IntoIterator<Item = &'a Location>,
    {
        let scope = self.active_scope()?;
        let stamp = format_rfc3339(last_run)?;

        let result = self.engine.with_connection(|conn| {
            let sp = conn.savepoint()?;

            let mut existed = Vec::new();
            for location in add_update {
                let file = match query_file(&sp, &location.file, scope)? {
                    Some(file) => file,
                    None => {
                        let hash = match hash_provider.as_deref_mut() {
                            Some(provider) => Some(provider(&location.file).map_err(|source| {
                                StoreError::Hash {
                                    path: location.file.clone(),
                                    source,
                                }
                            })?),
                            None => None,
                        };
                        insert_file(&sp, &location.file, hash, scope)?
                    }
                };
                existed.push(upsert_item(
                    &sp,
                    file.id,
                    location.lineno,
                    &location.testname,
                    &stamp,
                )?);
            }
            let (updated, added) = count_true_false(existed);

            let mut removed = 0;
            for location in try_delete {
                if delete_item(&sp, location, scope)? {
                    removed += 1;
                }
            }

            let pruned_files = if prune_files {
                Some(delete_files_without_items(&sp)?)
            } else {
                None
            };

            sp.commit()?;
            Ok(BulkUpdateResult {
                added,
                updated,
                removed,
                pruned_files,
            })
        })?;

        debug!(%result, "applied bulk update");
        Ok(result)
    }

    /// Deletes every item, then every file.
    ///
    /// # Errors
    /// Returns the usual session and `SQLite` errors.
    pub fn drop_all_entries(&self) -> Result<DropAllEntriesResult, StoreError> {
        self.active_scope()?;
        let result = self.engine.with_connection(|conn| {
            let sp = conn.savepoint()?;
            let tests_dropped = sp.execute("DELETE FROM test_item", [])?;
            let files_dropped = sp.execute("DELETE FROM test_file", [])?;
            sp.commit()?;
            Ok(DropAllEntriesResult {
                files_dropped,
                tests_dropped,
            })
        })?;
        debug!(%result, "dropped all entries");
        Ok(result)
    }

    /// # Errors
    /// Returns the usual session and `SQLite` errors.
    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.active_scope()?;
        self.engine.with_connection(|conn| {
            let files: i64 = conn.query_row("SELECT COUNT(*) FROM test_file", [], |row| row.get(0))?;
            let items: i64 = conn.query_row("SELECT COUNT(*) FROM test_item", [], |row| row.get(0))?;
            Ok(StoreCounts {
                files: count_to_usize(files)?,
                items: count_to_usize(items)?,
            })
        })
    }

    /// Lists all stored items ordered by location.
    ///
    /// # Errors
    /// Returns the usual session and `SQLite` errors.
    pub fn list_items(&self) -> Result<Vec<StoredItem>, StoreError> {
        self.active_scope()?;
        self.engine.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.path, i.lineno, i.testname, i.last_run
                 FROM test_item AS i
                 JOIN test_file AS f ON f.id = i.file_id
                 ORDER BY f.path ASC, i.lineno ASC, i.testname ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredItem {
                    location: Location::new(
                        row.get::<_, String>(0)?,
                        parse_lineno(row, 1)?,
                        row.get::<_, String>(2)?,
                    ),
                    last_run: parse_timestamp(row, 3)?,
                })
            })?;
            collect_rows(rows)
        })
    }

    fn active_scope(&self) -> Result<ScopeId, StoreError> {
        self.scope.ok_or(StoreError::InactiveSession)
    }

    fn ensure_attached(&self, file: &TestFile) -> Result<(), StoreError> {
        if self.active_scope()? != file.scope {
            return Err(StoreError::DetachedInstance(file.path.clone()));
        }
        Ok(())
    }
}

fn query_file(conn: &Connection, path: &str, scope: ScopeId) -> Result<Option<TestFile>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT id, path, last_hash FROM test_file WHERE path = ?1")?;
    let rows = stmt.query_map(params![path], |row| parse_file_row(row, scope))?;
    at_most_one(collect_rows(rows)?, || format!("test_file.path = {path:?}"))
}

fn insert_file(
    conn: &Connection,
    path: &str,
    hash: Option<FileDigest>,
    scope: ScopeId,
) -> Result<TestFile, StoreError> {
    conn.execute(
        "INSERT INTO test_file(path, last_hash) VALUES (?1, ?2)",
        params![path, hash.as_ref().map(|digest| digest.as_bytes().as_slice())],
    )?;
    Ok(TestFile {
        id: conn.last_insert_rowid(),
        path: path.to_string(),
        last_hash: hash,
        scope,
    })
}

fn query_item(
    conn: &Connection,
    file_id: i64,
    lineno: Option<u32>,
    testname: &str,
) -> Result<Option<TestItem>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, file_id, lineno, testname, last_run
         FROM test_item
         WHERE file_id = ?1 AND lineno IS ?2 AND testname = ?3",
    )?;
    let rows = stmt.query_map(
        params![file_id, lineno_to_sql(lineno), testname],
        parse_item_row,
    )?;
    at_most_one(collect_rows(rows)?, || {
        format!("test_item {testname:?} at line {lineno:?} in file {file_id}")
    })
}

/// Updates `last_run` of an existing item or inserts a new one. Returns
/// whether the item existed.
fn upsert_item(
    conn: &Connection,
    file_id: i64,
    lineno: Option<u32>,
    testname: &str,
    stamp: &str,
) -> Result<bool, StoreError> {
    let updated = conn
        .prepare_cached(
            "UPDATE test_item SET last_run = ?1
             WHERE file_id = ?2 AND lineno IS ?3 AND testname = ?4",
        )?
        .execute(params![stamp, file_id, lineno_to_sql(lineno), testname])?;
    match updated {
        0 => {
            conn.prepare_cached(
                "INSERT INTO test_item(file_id, lineno, testname, last_run)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![file_id, lineno_to_sql(lineno), testname, stamp])?;
            Ok(false)
        }
        1 => Ok(true),
        _ => Err(StoreError::MultipleResultsFound(format!(
            "test_item {testname:?} at line {lineno:?} in file {file_id}"
        ))),
    }
}

fn delete_item(conn: &Connection, location: &Location, scope: ScopeId) -> Result<bool, StoreError> {
    let Some(file) = query_file(conn, &location.file, scope)? else {
        return Ok(false);
    };
    let deleted = conn
        .prepare_cached(
            "DELETE FROM test_item
             WHERE file_id = ?1 AND lineno IS ?2 AND testname = ?3",
        )?
        .execute(params![
            file.id,
            lineno_to_sql(location.lineno),
            location.testname
        ])?;
    if deleted > 1 {
        return Err(StoreError::MultipleResultsFound(location.to_string()));
    }
    Ok(deleted == 1)
}

fn delete_files_without_items(conn: &Connection) -> Result<usize, StoreError> {
    let pruned = conn.execute(
        "DELETE FROM test_file
         WHERE NOT EXISTS (
           SELECT 1 FROM test_item WHERE test_item.file_id = test_file.id
         )",
        [],
    )?;
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{digest, loc, must, must_utc, populated, TempDb};
    use proptest::prelude::*;
    use std::collections::{BTreeSet, HashMap};

    fn stored_locations(engine: &Engine) -> Vec<Location> {
        must(engine.with_session(|session| session.list_items()))
            .into_iter()
            .map(|item| item.location)
            .collect()
    }

    #[test]
    fn operations_require_an_entered_session() {
        let db = TempDb::new();
        let engine = db.engine();
        let session = must(engine.new_session());
        assert!(!session.is_active());
        assert!(matches!(
            session.try_get_file("abc"),
            Err(StoreError::InactiveSession)
        ));
        assert!(matches!(session.prune_files(), Err(StoreError::InactiveSession)));
        assert!(matches!(
            session.drop_all_entries(),
            Err(StoreError::InactiveSession)
        ));
    }

    #[test]
    fn exited_session_rejects_operations() {
        let db = TempDb::new();
        let engine = db.engine();
        let mut session = must(engine.new_session());
        must(session.enter());
        must(session.add_file("abc", None));
        session.exit();
        assert!(matches!(
            session.try_get_file("abc"),
            Err(StoreError::InactiveSession)
        ));
    }

    #[test]
    fn files_are_found_by_path() {
        let db = TempDb::new();
        let engine = populated(&db);
        must(engine.with_session(|session| {
            let abc = session.try_get_file("abc")?;
            assert_eq!(abc.as_ref().and_then(TestFile::last_hash), Some(digest(1)));
            let ghi = session.try_get_file("ghi")?;
            assert!(ghi.is_some_and(|file| file.last_hash().is_none()));
            assert!(session.try_get_file("missing")?.is_none());
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn duplicate_file_is_an_integrity_error() {
        let db = TempDb::new();
        let engine = populated(&db);
        let result = engine.with_session(|session| session.add_file("abc", None));
        assert!(matches!(result, Err(StoreError::Integrity(_))));
    }

    #[test]
    fn items_are_found_by_file_line_and_name() {
        let db = TempDb::new();
        let engine = populated(&db);
        must(engine.with_session(|session| {
            let Some(abc) = session.try_get_file("abc")? else {
                panic!("fixture file abc is missing");
            };
            let item = session.try_get_item(&abc, Some(1), "t2")?;
            assert!(item.is_some_and(|item| item.testname() == "t2" && item.lineno() == Some(1)));
            assert!(session.try_get_item(&abc, Some(2), "t2")?.is_none());
            assert!(session.try_get_item(&abc, None, "t2")?.is_none());
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn items_without_line_numbers_are_distinct() {
        let db = TempDb::new();
        let engine = db.engine();
        let last_run = must_utc("2026-02-07T12:00:00Z");
        must(engine.with_session(|session| {
            let file = session.add_file("abc", None)?;
            session.add_or_update_item(&file, None, "t1", last_run)?;
            session.add_or_update_item(&file, None, "t1", last_run)?;
            session.add_or_update_item(&file, Some(3), "t1", last_run)?;
            assert_eq!(session.counts()?.items, 2);
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn handles_from_another_scope_are_detached() {
        let db = TempDb::new();
        let engine = populated(&db);
        let stale = must(engine.with_session(|session| session.try_get_file("abc")));
        let Some(mut stale) = stale else {
            panic!("fixture file abc is missing");
        };

        let last_run = must_utc("2026-02-07T12:00:00Z");
        must(engine.with_session(|session| {
            assert!(matches!(
                session.try_get_item(&stale, Some(0), "t1"),
                Err(StoreError::DetachedInstance(_))
            ));
            assert!(matches!(
                session.add_or_update_item(&stale, Some(0), "t1", last_run),
                Err(StoreError::DetachedInstance(_))
            ));
            assert!(matches!(
                session.invalidate_hash(&mut stale, digest(9)),
                Err(StoreError::DetachedInstance(_))
            ));
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn add_or_update_refreshes_last_run() {
        let db = TempDb::new();
        let engine = populated(&db);
        let later = must_utc("2026-02-08T08:30:00.5Z");
        must(engine.with_session(|session| {
            let Some(abc) = session.try_get_file("abc")? else {
                panic!("fixture file abc is missing");
            };
            let item = session.add_or_update_item(&abc, Some(0), "t1", later)?;
            assert_eq!(item.last_run(), later);
            assert_eq!(session.counts()?.items, 6);
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn invalidate_hash_replaces_hash_and_drops_items() {
        let db = TempDb::new();
        let engine = populated(&db);
        must(engine.with_session(|session| {
            let Some(mut abc) = session.try_get_file("abc")? else {
                panic!("fixture file abc is missing");
            };
            assert_eq!(session.invalidate_hash(&mut abc, digest(7))?, 4);
            assert_eq!(abc.last_hash(), Some(digest(7)));
            let reloaded = session.try_get_file("abc")?;
            assert_eq!(reloaded.and_then(|file| file.last_hash()), Some(digest(7)));
            assert_eq!(session.counts()?.items, 2);
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn prune_files_removes_only_files_without_items() {
        let db = TempDb::new();
        let engine = populated(&db);
        must(engine.with_session(|session| {
            assert_eq!(session.prune_files()?, 1);
            assert!(session.try_get_file("ghi")?.is_none());
            assert!(session.try_get_file("abc")?.is_some());
            assert_eq!(session.prune_files()?, 0);
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn prune_items_keeps_only_known_locations() {
        let db = TempDb::new();
        let engine = populated(&db);
        let known: HashSet<Location> = [loc("abc", 0, "t1"), loc("def", 1, "t6"), loc("xyz", 0, "t9")]
            .into_iter()
            .collect();
        let pruned = must(engine.with_session(|session| session.prune_items(&known)));
        assert_eq!(pruned, 4);
        assert_eq!(
            stored_locations(&engine),
            vec![loc("abc", 0, "t1"), loc("def", 1, "t6")]
        );
    }

    #[test]
    fn try_delete_item_reports_whether_something_was_deleted() {
        let db = TempDb::new();
        let engine = populated(&db);
        must(engine.with_session(|session| {
            assert!(session.try_delete_item(&loc("abc", 2, "t3"))?);
            assert!(!session.try_delete_item(&loc("abc", 2, "t3"))?);
            assert!(!session.try_delete_item(&loc("missing", 0, "t1"))?);
            assert_eq!(session.counts()?.items, 5);
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn bulk_update_adds_updates_and_removes_in_one_go() {
        let db = TempDb::new();
        let engine = populated(&db);
        let mut hashed = Vec::new();
        let mut provider = |path: &str| -> io::Result<FileDigest> {
            hashed.push(path.to_string());
            Ok(digest(5))
        };

        let add_update = vec![
            loc("abc", 0, "t1"),
            loc("abc", 9, "new"),
            loc("jkl", 0, "t7"),
            loc("jkl", 1, "t8"),
        ];
        let delete = vec![loc("def", 0, "t5"), loc("def", 1, "t6"), loc("nope", 0, "t0")];
        let result = must(engine.with_session(|session| {
            session.bulk_add_update_remove(
                must_utc("2026-02-08T00:00:00Z"),
                &add_update,
                &delete,
                Some(&mut provider),
                true,
            )
        }));

        assert_eq!(
            result,
            BulkUpdateResult {
                added: 3,
                updated: 1,
                removed: 2,
                pruned_files: Some(2),
            }
        );
        assert_eq!(hashed, vec!["jkl".to_string()]);
        must(engine.with_session(|session| {
            assert!(session.try_get_file("def")?.is_none());
            assert!(session.try_get_file("ghi")?.is_none());
            let jkl = session.try_get_file("jkl")?;
            assert_eq!(jkl.and_then(|file| file.last_hash()), Some(digest(5)));
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn bulk_update_without_pruning_or_hashing() {
        let db = TempDb::new();
        let engine = populated(&db);
        let add_update = vec![loc("jkl", 0, "t7")];
        let result = must(engine.with_session(|session| {
            session.bulk_add_update_remove(
                must_utc("2026-02-08T00:00:00Z"),
                &add_update,
                &[],
                None,
                false,
            )
        }));
        assert_eq!(result.pruned_files, None);
        assert_eq!(result.to_string(), "1 added, 0 updated, 0 removed");
        must(engine.with_session(|session| {
            let jkl = session.try_get_file("jkl")?;
            assert!(jkl.is_some_and(|file| file.last_hash().is_none()));
            assert!(session.try_get_file("ghi")?.is_some());
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn failed_hash_rolls_back_the_whole_bulk_update() {
        let db = TempDb::new();
        let engine = populated(&db);
        let mut provider = |_: &str| -> io::Result<FileDigest> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        };
        let add_update = vec![loc("abc", 9, "new"), loc("jkl", 0, "t7")];
        let delete = vec![loc("abc", 0, "t1")];
        let result = engine.with_session(|session| {
            session.bulk_add_update_remove(
                must_utc("2026-02-08T00:00:00Z"),
                &add_update,
                &delete,
                Some(&mut provider),
                true,
            )
        });
        assert!(matches!(result, Err(StoreError::Hash { ref path, .. }) if path == "jkl"));

        let counts = must(engine.with_session(|session| session.counts()));
        assert_eq!((counts.files, counts.items), (3, 6));
    }

    #[test]
    fn drop_all_entries_empties_both_tables() {
        let db = TempDb::new();
        let engine = populated(&db);
        let result = must(engine.with_session(|session| session.drop_all_entries()));
        assert_eq!(result.to_string(), "3 files dropped, 6 tests dropped");
        let counts = must(engine.with_session(|session| session.counts()));
        assert_eq!((counts.files, counts.items), (0, 0));
    }

    #[test]
    fn duplicated_rows_are_reported_and_not_deleted() {
        let db = TempDb::new();
        {
            let conn = match Connection::open(db.path()) {
                Ok(conn) => conn,
                Err(err) => panic!("failed to open fixture db: {err}"),
            };
            // Same columns, no uniqueness constraints.
            let created = conn.execute_batch(
                "CREATE TABLE test_file (id INTEGER PRIMARY KEY, path TEXT NOT NULL, last_hash BLOB);
                 CREATE TABLE test_item (
                   id INTEGER PRIMARY KEY, file_id INTEGER NOT NULL, lineno INTEGER,
                   testname TEXT NOT NULL, last_run TEXT NOT NULL
                 );
                 INSERT INTO test_file(id, path) VALUES (1, 'abc'), (2, 'dup'), (3, 'dup');
                 INSERT INTO test_item(file_id, lineno, testname, last_run) VALUES
                   (1, 0, 't1', '2026-02-07T12:00:00Z'),
                   (1, 0, 't1', '2026-02-07T12:00:00Z');",
            );
            if let Err(err) = created {
                panic!("failed to create fixture tables: {err}");
            }
        }

        let engine = db.engine();
        must(engine.with_session(|session| {
            assert!(matches!(
                session.try_get_file("dup"),
                Err(StoreError::MultipleResultsFound(_))
            ));
            assert!(matches!(
                session.try_delete_item(&loc("abc", 0, "t1")),
                Err(StoreError::MultipleResultsFound(_))
            ));
            assert_eq!(session.counts()?.items, 2);
            Ok::<_, StoreError>(())
        }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_bulk_update_counts_match_store_contents(
            existing in prop::collection::btree_set((0_u32..4, 0_u32..6), 0..12),
            picks in prop::collection::btree_set((0_u32..4, 0_u32..6), 0..12),
            drops in prop::collection::btree_set((0_u32..4, 0_u32..6), 0..8),
        ) {
            let db = TempDb::new();
            let engine = db.engine();
            let to_location = |(file, line): &(u32, u32)| loc(&format!("f{file}"), *line, "t");
            let earlier = must_utc("2026-02-07T00:00:00Z");
            let later = must_utc("2026-02-08T00:00:00Z");

            let seeded: Vec<Location> = existing.iter().map(to_location).collect();
            must(engine.with_session(|session| {
                session.bulk_add_update_remove(earlier, &seeded, std::iter::empty(), None, false)
            }));

            let deleted: BTreeSet<(u32, u32)> = drops.difference(&picks).copied().collect();
            let add_update: Vec<Location> = picks.iter().map(to_location).collect();
            let delete: Vec<Location> = deleted.iter().map(to_location).collect();
            let result = must(engine.with_session(|session| {
                session.bulk_add_update_remove(later, &add_update, &delete, None, true)
            }));

            let updated = picks.intersection(&existing).count();
            let removed = deleted.intersection(&existing).count();
            let after: BTreeSet<(u32, u32)> = existing
                .union(&picks)
                .copied()
                .filter(|pair| !deleted.contains(pair))
                .collect();
            let files_before: BTreeSet<u32> = existing.iter().map(|(file, _)| *file).collect();
            let files_after: BTreeSet<u32> = after.iter().map(|(file, _)| *file).collect();

            prop_assert_eq!(result.added, picks.len() - updated);
            prop_assert_eq!(result.updated, updated);
            prop_assert_eq!(result.removed, removed);
            prop_assert_eq!(
                result.pruned_files,
                Some(files_before.difference(&files_after).count())
            );
            prop_assert_eq!(after.len(), existing.len() + (picks.len() - updated) - removed);

            let stored = must(engine.with_session(|session| session.list_items()));
            let expected: Vec<Location> = after.iter().map(to_location).collect();
            prop_assert_eq!(
                stored.iter().map(|item| item.location.clone()).collect::<Vec<_>>(),
                expected
            );
            for item in &stored {
                let refreshed = add_update.contains(&item.location);
                prop_assert_eq!(item.last_run, if refreshed { later } else { earlier });
            }
        }

        #[test]
        fn prop_add_or_update_keeps_one_item_with_the_latest_run(
            calls in prop::collection::vec((prop::option::of(0_u32..5), 0_i64..10_000), 1..20),
        ) {
            let db = TempDb::new();
            let engine = db.engine();
            let base = must_utc("2026-02-08T00:00:00Z");
            let mut latest: HashMap<Location, OffsetDateTime> = HashMap::new();

            must(engine.with_session(|session| {
                let file = session.add_file("test_a.py", None)?;
                for (lineno, minutes) in &calls {
                    let last_run = base + time::Duration::minutes(*minutes);
                    session.add_or_update_item(&file, *lineno, "t", last_run)?;
                    latest.insert(Location::new("test_a.py", *lineno, "t"), last_run);
                }
                Ok::<_, StoreError>(())
            }));

            let counts = must(engine.with_session(|session| session.counts()));
            prop_assert_eq!(counts.files, 1);
            prop_assert_eq!(counts.items, latest.len());
            let stored: HashMap<Location, OffsetDateTime> =
                must(engine.with_session(|session| session.list_items()))
                    .into_iter()
                    .map(|item| (item.location, item.last_run))
                    .collect();
            prop_assert_eq!(stored, latest);
        }

        #[test]
        fn prop_prune_items_is_idempotent(
            keep in prop::collection::hash_set(0_usize..6, 0..6),
        ) {
            let db = TempDb::new();
            let engine = populated(&db);
            let known: HashSet<Location> = stored_locations(&engine)
                .into_iter()
                .enumerate()
                .filter(|(index, _)| keep.contains(index))
                .map(|(_, location)| location)
                .collect();

            let first = must(engine.with_session(|session| session.prune_items(&known)));
            let remaining = stored_locations(&engine);
            let second = must(engine.with_session(|session| session.prune_items(&known)));

            prop_assert_eq!(second, 0);
            prop_assert_eq!(stored_locations(&engine), remaining.clone());
            prop_assert_eq!(remaining.len(), known.len());
            prop_assert_eq!(first + remaining.len(), 6);
        }
    }
}
