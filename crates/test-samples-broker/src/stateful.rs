use std::collections::HashSet;
use std::path::PathBuf;

use test_samples_core::{
    move_idx_to_end_by_key, now_utc, ItemDirective, LocatedItem, Location, RunExitStatus,
};
use test_samples_store_sqlite::Engine;
use tracing::{error, info};

use crate::run::RunCore;
use crate::{
    compare_against_database, open_store, BrokerConfig, BrokerDiagnostic, BrokerError,
    ComparisonResult, FinishReport, ReconcileSettings, ReconcileStrategy, Reconciliation,
    TestFileHasher,
};

/// Orders items by their recorded history and reconciles the run's
/// outcomes into the store through the strategy `S`.
#[derive(Debug)]
pub struct StatefulBroker<S> {
    core: RunCore,
    db_path: PathBuf,
    overwrite_broken_db: bool,
    randomize: bool,
    settings: ReconcileSettings,
    strategy: S,
    engine: Option<Engine>,
    num_tests: Option<usize>,
}

impl<S: ReconcileStrategy> StatefulBroker<S> {
    /// # Errors
    /// Returns [`BrokerError::Usage`] when the configuration has no
    /// database path.
    pub fn new(
        config: &BrokerConfig,
        strategy: S,
        diagnostics: Vec<BrokerDiagnostic>,
    ) -> Result<Self, BrokerError> {
        let db_path = config
            .db_path
            .clone()
            .ok_or_else(|| BrokerError::usage("no database path was provided"))?;
        Ok(Self {
            core: RunCore::new(config, diagnostics),
            db_path,
            overwrite_broken_db: config.overwrite_broken_db,
            randomize: config.randomize,
            settings: ReconcileSettings {
                hasher: config
                    .hash_testfiles
                    .then(|| TestFileHasher::new(config.rootpath.clone())),
                no_pruning: config.no_pruning,
                reset_on_saturation: config.reset_on_saturation,
            },
            strategy,
            engine: None,
            num_tests: None,
        })
    }

    #[must_use]
    pub fn seed(&self) -> &str {
        self.core.seed()
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[BrokerDiagnostic] {
        self.core.diagnostics()
    }

    /// Opens the store and reorders `items`: items without a trusted
    /// successful run first, in collected (or shuffled) order, then the
    /// known items, most recently run first.
    ///
    /// Also prunes stored items that were not collected, or empties the
    /// store when every item is known and reset on saturation is enabled.
    ///
    /// # Errors
    /// Returns [`BrokerError::Usage`] when the store cannot be opened and
    /// the store error of a failing comparison.
    pub fn modify_items<T: LocatedItem>(&mut self, items: &mut Vec<T>) -> Result<(), BrokerError> {
        if self.engine.is_some() {
            return Err(BrokerError::usage("the collected items were already modified"));
        }
        if self.randomize {
            self.core.shuffle(items);
        }

        let engine = self
            .engine
            .insert(open_store(&self.db_path, self.overwrite_broken_db)?);

        let num_tests = items.len();
        self.num_tests = Some(num_tests);
        if num_tests == 0 {
            return Ok(());
        }

        let settings = &self.settings;
        let comparison = engine.with_session(|session| {
            let comparison = compare_against_database(
                session,
                items.iter().map(LocatedItem::location),
                settings.hasher.as_ref(),
                now_utc(),
            )?;

            if comparison.known_indices.len() == num_tests {
                info!("the history store is saturated");
                if settings.reset_on_saturation {
                    let dropped = session.drop_all_entries()?;
                    info!(%dropped, "saturated");
                    return Ok(None);
                }
            }

            if !settings.no_pruning {
                let known: HashSet<Location> =
                    items.iter().map(|item| item.location().clone()).collect();
                let pruned = session.prune_items(&known)?;
                info!(pruned, "pruned disappeared tests");
            }
            Ok::<_, BrokerError>(Some(comparison))
        })?;

        let Some(ComparisonResult {
            known_indices,
            recency,
        }) = comparison
        else {
            return Ok(());
        };

        info!(count = known_indices.len(), "moving known items to end of list");
        move_idx_to_end_by_key(items, &known_indices, |item| {
            recency.get(item.location()).copied().unwrap_or_default()
        })?;
        Ok(())
    }

    pub fn before_item(&mut self) -> ItemDirective {
        self.core.before_item()
    }

    /// Hands the outcome of a finished item to the write strategy. Empty
    /// states and reports after [`StatefulBroker::finish`] are ignored.
    ///
    /// # Errors
    /// Returns [`BrokerError::EngineNotReady`] before
    /// [`StatefulBroker::modify_items`], or the error of an immediate write.
    pub fn report_outcome(&mut self, location: &Location, state: &str) -> Result<(), BrokerError> {
        let Some(outcome) = self.core.classify(location, state) else {
            return Ok(());
        };
        let engine = self.engine.as_ref().ok_or(BrokerError::EngineNotReady)?;
        self.strategy
            .record_outcome(engine, &self.settings, location, outcome.action())
    }

    /// Reconciles the run into the store, unless `exit_status` is abnormal,
    /// and disposes the engine. Disposal happens even when reconciliation
    /// fails.
    ///
    /// # Errors
    /// Returns [`BrokerError::AlreadyFinished`] when called twice,
    /// [`BrokerError::EngineNotReady`] before
    /// [`StatefulBroker::modify_items`] and otherwise the first error of
    /// reconciliation or disposal.
    pub fn finish(&mut self, exit_status: RunExitStatus) -> Result<FinishReport, BrokerError> {
        if self.core.is_finished() {
            return Err(BrokerError::AlreadyFinished);
        }
        self.core.mark_finished();

        let Some(engine) = self.engine.take() else {
            return Err(BrokerError::EngineNotReady);
        };
        let reconciled = self.reconcile(&engine, exit_status);
        let disposed = engine.dispose();
        if let (Err(_), Err(err)) = (&reconciled, &disposed) {
            error!(error = %err, "failed to dispose the history database engine");
        }
        let reconciliation = reconciled?;
        disposed?;

        Ok(FinishReport {
            reconciliation,
            counts: self.strategy.counts(),
            diagnostics: self.core.take_diagnostics(),
        })
    }

    fn reconcile(
        &mut self,
        engine: &Engine,
        exit_status: RunExitStatus,
    ) -> Result<Reconciliation, BrokerError> {
        if exit_status.is_abnormal() {
            info!(
                exit_status = exit_status.code(),
                "abnormal exit status, skipping reconciliation"
            );
            return Ok(Reconciliation::Skipped {
                exit_code: exit_status.code(),
            });
        }
        let num_tests = self.num_tests.ok_or(BrokerError::EngineNotReady)?;
        self.strategy.finalize(engine, &self.settings, num_tests)
    }
}
