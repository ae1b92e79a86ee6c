use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use test_samples_core::{hash_file, FileDigest, Location};
use test_samples_store_sqlite::{Session, TestFile};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::BrokerError;

/// Hashes test files given their path relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFileHasher {
    rootpath: PathBuf,
}

impl TestFileHasher {
    #[must_use]
    pub fn new(rootpath: impl Into<PathBuf>) -> Self {
        Self {
            rootpath: rootpath.into(),
        }
    }

    #[must_use]
    pub fn rootpath(&self) -> &Path {
        &self.rootpath
    }

    /// # Errors
    /// Returns the I/O error raised while reading the file.
    pub fn hash(&self, path: &str) -> io::Result<FileDigest> {
        hash_file(&self.rootpath.join(path))
    }
}

/// Which collected items have a trusted successful run in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparisonResult {
    /// Indices into the collected list, ascending.
    pub known_indices: Vec<usize>,
    /// Time since the last successful run, per known location.
    pub recency: HashMap<Location, Duration>,
}

/// Matches `locations` against the store.
///
/// Items of unknown files are never known. With a `hasher`, every stored
/// file is hashed once; a mismatch invalidates the file, which deletes its
/// items, and excludes all of its items from this comparison.
///
/// # Errors
/// Returns [`BrokerError::Hash`] when a test file cannot be hashed, or the
/// store error of the failing lookup.
pub fn compare_against_database<'a>(
    session: &Session<'_>,
    locations: impl IntoIterator<Item = &'a Location>,
    hasher: Option<&TestFileHasher>,
    now: OffsetDateTime,
) -> Result<ComparisonResult, BrokerError> {
    let mut files: HashMap<&str, Option<TestFile>> = HashMap::new();
    let mut confirmed: HashSet<i64> = HashSet::new();
    let mut invalidated: HashSet<i64> = HashSet::new();
    let mut result = ComparisonResult::default();

    for (index, location) in locations.into_iter().enumerate() {
        if !files.contains_key(location.file.as_str()) {
            let loaded = session.try_get_file(&location.file)?;
            files.insert(location.file.as_str(), loaded);
        }
        let Some(Some(file)) = files.get_mut(location.file.as_str()) else {
            continue;
        };

        if invalidated.contains(&file.id()) {
            continue;
        }
        if let Some(hasher) = hasher {
            if !confirmed.contains(&file.id()) {
                let digest = hasher.hash(&location.file).map_err(|source| BrokerError::Hash {
                    path: location.file.clone(),
                    source,
                })?;
                if file.last_hash() == Some(digest) {
                    confirmed.insert(file.id());
                } else {
                    let deleted = session.invalidate_hash(file, digest)?;
                    info!(path = %location.file, deleted, "removed test items when updating hash");
                    invalidated.insert(file.id());
                    continue;
                }
            }
        }

        let Some(item) = session.try_get_item(file, location.lineno, &location.testname)? else {
            continue;
        };
        let elapsed = Duration::try_from(now - item.last_run()).unwrap_or(Duration::ZERO);
        result.recency.insert(location.clone(), elapsed);
        result.known_indices.push(index);
    }

    debug!(
        known = result.known_indices.len(),
        invalidated = invalidated.len(),
        "compared collected items against the store"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{loc, must, ProjectDir};
    use test_samples_store_sqlite::Engine;

    fn seed_store(engine: &Engine, hasher: Option<&TestFileHasher>, last_run: OffsetDateTime) {
        must(engine.with_session(|session| {
            for (path, names) in [("test_a.py", ["a1", "a2"]), ("test_b.py", ["b1", "b2"])] {
                let hash = hasher.map(|hasher| hasher.hash(path)).transpose().map_err(|source| {
                    BrokerError::Hash {
                        path: path.to_string(),
                        source,
                    }
                })?;
                let file = session.add_file(path, hash)?;
                for (lineno, name) in (1_u32..).zip(names) {
                    session.add_or_update_item(&file, Some(lineno), name, last_run)?;
                }
            }
            Ok::<_, BrokerError>(())
        }));
    }

    #[test]
    fn unknown_files_and_items_are_not_known() {
        let project = ProjectDir::new(&[]);
        let engine = project.engine();
        let last_run = test_samples_core::now_utc();
        seed_store(&engine, None, last_run);

        let collected = vec![
            loc("test_c.py", 1, "c1"),
            loc("test_a.py", 1, "a1"),
            loc("test_a.py", 3, "a3"),
            loc("test_b.py", 2, "b2"),
        ];
        let result = must(engine.with_session(|session| {
            compare_against_database(session, &collected, None, last_run + time::Duration::minutes(5))
        }));

        assert_eq!(result.known_indices, vec![1, 3]);
        assert_eq!(
            result.recency.get(&loc("test_a.py", 1, "a1")),
            Some(&Duration::from_secs(300))
        );
        assert!(!result.recency.contains_key(&loc("test_a.py", 3, "a3")));
    }

    #[test]
    fn changed_file_is_invalidated_once() {
        let project = ProjectDir::new(&[("test_a.py", "a = 1\n"), ("test_b.py", "b = 1\n")]);
        let engine = project.engine();
        let hasher = project.hasher();
        let last_run = test_samples_core::now_utc();
        seed_store(&engine, Some(&hasher), last_run);

        project.write("test_a.py", "a = 2\n");
        let collected = vec![
            loc("test_a.py", 1, "a1"),
            loc("test_b.py", 1, "b1"),
            loc("test_a.py", 2, "a2"),
            loc("test_b.py", 2, "b2"),
        ];
        let result = must(engine.with_session(|session| {
            compare_against_database(session, &collected, Some(&hasher), last_run)
        }));
        assert_eq!(result.known_indices, vec![1, 3]);

        let stored = must(engine.with_session(|session| {
            let file = session.try_get_file("test_a.py")?;
            Ok::<_, BrokerError>((file, session.counts()?))
        }));
        let (file, counts) = stored;
        let expected = must(hasher.hash("test_a.py").map_err(BrokerError::from));
        assert_eq!(file.and_then(|file| file.last_hash()), Some(expected));
        assert_eq!(counts.items, 2);
    }

    #[test]
    fn missing_test_file_fails_hashing() {
        let project = ProjectDir::new(&[("test_a.py", "a = 1\n"), ("test_b.py", "b = 1\n")]);
        let engine = project.engine();
        let hasher = project.hasher();
        seed_store(&engine, Some(&hasher), test_samples_core::now_utc());

        project.remove("test_b.py");
        let collected = vec![loc("test_b.py", 1, "b1")];
        let result = engine.with_session(|session| {
            compare_against_database(session, &collected, Some(&hasher), test_samples_core::now_utc())
        });
        assert!(matches!(result, Err(BrokerError::Hash { ref path, .. }) if path == "test_b.py"));
    }
}
