use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use test_samples_core::{now_utc, Location, ResultAction};
use test_samples_store_sqlite::{BulkUpdateResult, DropAllEntriesResult, Engine};
use tracing::{error, info};

use crate::{BrokerError, TestFileHasher};

/// Store related settings shared by both write strategies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Set when test files are tracked by hash.
    pub hasher: Option<TestFileHasher>,
    pub no_pruning: bool,
    pub reset_on_saturation: bool,
}

/// What the end-of-run reconciliation did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Nothing is persisted in nostate mode.
    NoState,
    /// The run ended abnormally with the given exit code.
    Skipped { exit_code: i32 },
    /// Every collected item passed; the store was emptied.
    Reset(DropAllEntriesResult),
    PrunedFiles(usize),
    /// Immediate writes with pruning disabled.
    Unchanged,
    Bulk(BulkUpdateResult),
}

impl Reconciliation {
    /// Stable machine readable name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoState => "nostate",
            Self::Skipped { .. } => "skipped",
            Self::Reset(_) => "reset",
            Self::PrunedFiles(_) => "pruned_files",
            Self::Unchanged => "unchanged",
            Self::Bulk(_) => "bulk",
        }
    }
}

impl Display for Reconciliation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoState => f.write_str("no state recorded"),
            Self::Skipped { exit_code } => write!(
                f,
                "reconciliation skipped after abnormal exit status {exit_code}"
            ),
            Self::Reset(dropped) => write!(f, "saturated: {dropped}"),
            Self::PrunedFiles(pruned) => write!(f, "{pruned} pruned files"),
            Self::Unchanged => f.write_str("no pruning requested"),
            Self::Bulk(result) => write!(f, "{result}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub passed: usize,
    pub failed: usize,
}

/// Decides when reported outcomes reach the store.
pub trait ReconcileStrategy {
    /// Records one `Write` or `Drop` action.
    ///
    /// # Errors
    /// Returns the store error of an immediate write.
    fn record_outcome(
        &mut self,
        engine: &Engine,
        settings: &ReconcileSettings,
        location: &Location,
        action: ResultAction,
    ) -> Result<(), BrokerError>;

    /// Applies the end-of-run reconciliation for a run that terminated
    /// normally.
    ///
    /// # Errors
    /// Returns the store error that aborted the reconciliation.
    fn finalize(
        &mut self,
        engine: &Engine,
        settings: &ReconcileSettings,
        num_tests: usize,
    ) -> Result<Reconciliation, BrokerError>;

    fn counts(&self) -> OutcomeCounts;
}

/// Writes each outcome to the store as soon as it is reported.
#[derive(Debug, Default)]
pub struct ImmediateWrites {
    passed: usize,
    failed: usize,
}

impl ReconcileStrategy for ImmediateWrites {
    fn record_outcome(
        &mut self,
        engine: &Engine,
        settings: &ReconcileSettings,
        location: &Location,
        action: ResultAction,
    ) -> Result<(), BrokerError> {
        match action {
            ResultAction::Ignore => Ok(()),
            ResultAction::Drop => {
                engine.with_session(|session| session.try_delete_item(location))?;
                self.failed += 1;
                Ok(())
            }
            ResultAction::Write => {
                engine.with_session(|session| {
                    let file = match session.try_get_file(&location.file)? {
                        Some(file) => file,
                        None => {
                            let hash = settings
                                .hasher
                                .as_ref()
                                .map(|hasher| hasher.hash(&location.file))
                                .transpose()
                                .map_err(|source| BrokerError::Hash {
                                    path: location.file.clone(),
                                    source,
                                })?;
                            session.add_file(&location.file, hash)?
                        }
                    };
                    session.add_or_update_item(
                        &file,
                        location.lineno,
                        &location.testname,
                        now_utc(),
                    )?;
                    Ok::<_, BrokerError>(())
                })?;
                self.passed += 1;
                Ok(())
            }
        }
    }

    fn finalize(
        &mut self,
        engine: &Engine,
        settings: &ReconcileSettings,
        num_tests: usize,
    ) -> Result<Reconciliation, BrokerError> {
        check_test_nums(self.passed, self.failed, num_tests);

        if num_tests > 0 && self.passed == num_tests {
            info!("all tests have passed");
            if settings.reset_on_saturation {
                let dropped = engine.with_session(|session| session.drop_all_entries())?;
                info!(%dropped, "saturated");
                return Ok(Reconciliation::Reset(dropped));
            }
        }

        if settings.no_pruning {
            return Ok(Reconciliation::Unchanged);
        }
        let pruned = engine.with_session(|session| session.prune_files())?;
        info!(pruned, "pruned files from the store");
        Ok(Reconciliation::PrunedFiles(pruned))
    }

    fn counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            passed: self.passed,
            failed: self.failed,
        }
    }
}

/// Buffers outcomes and writes them in one transaction at finish.
#[derive(Debug, Default)]
pub struct LazyWrites {
    passed: BTreeSet<Location>,
    failed: BTreeSet<Location>,
}

impl LazyWrites {
    /// Passed locations without those that also failed. A test passing
    /// before its fixture teardown fails is reported both ways; the failure
    /// wins.
    fn passed_only(&self) -> BTreeSet<Location> {
        self.passed.difference(&self.failed).cloned().collect()
    }
}

impl ReconcileStrategy for LazyWrites {
    fn record_outcome(
        &mut self,
        _engine: &Engine,
        _settings: &ReconcileSettings,
        location: &Location,
        action: ResultAction,
    ) -> Result<(), BrokerError> {
        match action {
            ResultAction::Write => {
                self.passed.insert(location.clone());
            }
            ResultAction::Drop => {
                self.failed.insert(location.clone());
            }
            ResultAction::Ignore => {}
        }
        Ok(())
    }

    fn finalize(
        &mut self,
        engine: &Engine,
        settings: &ReconcileSettings,
        num_tests: usize,
    ) -> Result<Reconciliation, BrokerError> {
        let passed = self.passed_only();
        check_test_nums(passed.len(), self.failed.len(), num_tests);

        if num_tests > 0 && passed.len() == num_tests {
            info!("all tests have passed");
            if settings.reset_on_saturation {
                let dropped = engine.with_session(|session| session.drop_all_entries())?;
                info!(%dropped, "saturated");
                return Ok(Reconciliation::Reset(dropped));
            }
        }

        let prune_files = !settings.no_pruning;
        let result = engine.with_session(|session| match settings.hasher.as_ref() {
            Some(hasher) => {
                let mut provider = |path: &str| hasher.hash(path);
                session.bulk_add_update_remove(
                    now_utc(),
                    &passed,
                    &self.failed,
                    Some(&mut provider),
                    prune_files,
                )
            }
            None => {
                session.bulk_add_update_remove(now_utc(), &passed, &self.failed, None, prune_files)
            }
        })?;
        info!(%result, "updated items of the test run");
        Ok(Reconciliation::Bulk(result))
    }

    fn counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            passed: self.passed_only().len(),
            failed: self.failed.len(),
        }
    }
}

fn check_test_nums(passed: usize, failed: usize, num_tests: usize) {
    if passed + failed > num_tests {
        error!(
            passed,
            failed, num_tests, "more passed and failed tests than collected tests"
        );
    }
}
