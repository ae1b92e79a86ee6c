use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use test_samples_core::{ItemDirective, Location, TestOutcome, TimeoutGovernor};
use tracing::{debug, warn};

use crate::config::seeded_rng;
use crate::{BrokerConfig, BrokerDiagnostic};

/// Per-run state shared by every broker: the RNG, the soft timeout and the
/// collected diagnostics.
#[derive(Debug)]
pub(crate) struct RunCore {
    seed: String,
    rng: ChaCha8Rng,
    governor: TimeoutGovernor,
    diagnostics: Vec<BrokerDiagnostic>,
    finished: bool,
}

impl RunCore {
    pub(crate) fn new(config: &BrokerConfig, diagnostics: Vec<BrokerDiagnostic>) -> Self {
        let seed = config.resolve_seed();
        Self {
            rng: seeded_rng(&seed),
            seed,
            governor: TimeoutGovernor::new(config.soft_timeout),
            diagnostics,
            finished: false,
        }
    }

    pub(crate) fn seed(&self) -> &str {
        &self.seed
    }

    pub(crate) fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    pub(crate) fn before_item(&mut self) -> ItemDirective {
        self.governor.check_item()
    }

    pub(crate) fn diagnostics(&self) -> &[BrokerDiagnostic] {
        &self.diagnostics
    }

    pub(crate) fn take_diagnostics(&mut self) -> Vec<BrokerDiagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Parses a reported state. Returns `None` for reports that must not be
    /// processed: late reports after finish and empty states.
    pub(crate) fn classify(&mut self, location: &Location, state: &str) -> Option<TestOutcome> {
        if self.finished {
            debug!(%location, state, "ignoring outcome reported after finish");
            return None;
        }
        if state.is_empty() {
            return None;
        }

        let outcome = TestOutcome::parse(state);
        if let TestOutcome::Unrecognized(raw) = &outcome {
            warn!(%location, state = %raw, "unexpected test result state, the test will be ignored");
            self.diagnostics.push(BrokerDiagnostic::UnrecognizedOutcome {
                state: raw.clone(),
                location: location.clone(),
            });
        }
        Some(outcome)
    }
}
