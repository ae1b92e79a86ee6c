use test_samples_core::{ItemDirective, LocatedItem, Location, RunExitStatus};
use tracing::info;

use crate::run::RunCore;
use crate::{BrokerConfig, BrokerDiagnostic, BrokerError, FinishReport, OutcomeCounts, Reconciliation};

/// Shuffles the collected items so a different subset runs first on every
/// run. Nothing is persisted.
#[derive(Debug)]
pub struct NoStateBroker {
    core: RunCore,
}

impl NoStateBroker {
    #[must_use]
    pub fn new(config: &BrokerConfig, diagnostics: Vec<BrokerDiagnostic>) -> Self {
        Self {
            core: RunCore::new(config, diagnostics),
        }
    }

    #[must_use]
    pub fn seed(&self) -> &str {
        self.core.seed()
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[BrokerDiagnostic] {
        self.core.diagnostics()
    }

    pub fn modify_items<T: LocatedItem>(&mut self, items: &mut [T]) {
        self.core.shuffle(items);
        info!(count = items.len(), "shuffled collected items");
    }

    pub fn before_item(&mut self) -> ItemDirective {
        self.core.before_item()
    }

    /// Only validates the state so unknown outcomes still surface as
    /// diagnostics.
    pub fn report_outcome(&mut self, location: &Location, state: &str) {
        let _ = self.core.classify(location, state);
    }

    /// # Errors
    /// Returns [`BrokerError::AlreadyFinished`] when called twice.
    pub fn finish(&mut self, exit_status: RunExitStatus) -> Result<FinishReport, BrokerError> {
        if self.core.is_finished() {
            return Err(BrokerError::AlreadyFinished);
        }
        self.core.mark_finished();
        info!(exit_status = exit_status.code(), "nostate run finished");
        Ok(FinishReport {
            reconciliation: Reconciliation::NoState,
            counts: OutcomeCounts::default(),
            diagnostics: self.core.take_diagnostics(),
        })
    }
}
