//! Decides which collected test items run first and reconciles the outcome
//! of a run into the history store.
//!
//! A run drives a [`Broker`] through four hooks, in order:
//! [`Broker::modify_items`] once after collection, [`Broker::before_item`]
//! and [`Broker::report_outcome`] per item, and [`Broker::finish`] once.

use std::io;

use serde::Serialize;
use test_samples_core::{CoreError, ItemDirective, LocatedItem, Location, RunExitStatus};
use test_samples_store_sqlite::StoreError;

mod compare;
mod config;
mod nostate;
mod recovery;
mod run;
mod stateful;
mod strategy;

pub use compare::{compare_against_database, ComparisonResult, TestFileHasher};
pub use config::{
    parse_soft_timeout, seeded_rng, BrokerConfig, Mode, WriteMode, DEFAULT_SOFT_TIMEOUT,
};
pub use nostate::NoStateBroker;
pub use recovery::open_store;
pub use stateful::StatefulBroker;
pub use strategy::{
    ImmediateWrites, LazyWrites, OutcomeCounts, ReconcileSettings, ReconcileStrategy,
    Reconciliation,
};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Fatal, operator facing configuration or environment problem.
    #[error("{message}")]
    Usage {
        message: String,
        #[source]
        source: Option<StoreError>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("failed to hash test file {path}")]
    Hash {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("the history store is not open; modify_items must run first")]
    EngineNotReady,
    #[error("the run was already finished")]
    AlreadyFinished,
    #[error("i/o error")]
    Io(#[from] io::Error),
}

impl BrokerError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
            source: None,
        }
    }

    pub fn usage_with(message: impl Into<String>, source: StoreError) -> Self {
        Self::Usage {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Non-fatal events surfaced to the caller instead of aborting the run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerDiagnostic {
    /// The harness reported a state this broker does not know. The item
    /// was ignored for reconciliation.
    UnrecognizedOutcome { state: String, location: Location },
    /// A seed makes every nostate run identical.
    SeedSetInNoStateMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishReport {
    pub reconciliation: Reconciliation,
    pub counts: OutcomeCounts,
    pub diagnostics: Vec<BrokerDiagnostic>,
}

#[derive(Debug)]
pub enum Broker {
    NoState(NoStateBroker),
    Immediate(StatefulBroker<ImmediateWrites>),
    Lazy(StatefulBroker<LazyWrites>),
}

impl Broker {
    /// Validates `config` and builds the broker for its mode.
    ///
    /// # Errors
    /// Returns [`BrokerError::Usage`] for an invalid configuration.
    pub fn from_config(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let diagnostics = config.validate()?;
        let broker = match (config.mode, config.write_mode) {
            (Mode::NoState, _) => Self::NoState(NoStateBroker::new(config, diagnostics)),
            (Mode::Stateful, WriteMode::Immediate) => Self::Immediate(StatefulBroker::new(
                config,
                ImmediateWrites::default(),
                diagnostics,
            )?),
            (Mode::Stateful, WriteMode::Lazy) => Self::Lazy(StatefulBroker::new(
                config,
                LazyWrites::default(),
                diagnostics,
            )?),
        };
        Ok(broker)
    }

    /// The RNG seed of this run.
    #[must_use]
    pub fn seed(&self) -> &str {
        match self {
            Self::NoState(broker) => broker.seed(),
            Self::Immediate(broker) => broker.seed(),
            Self::Lazy(broker) => broker.seed(),
        }
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[BrokerDiagnostic] {
        match self {
            Self::NoState(broker) => broker.diagnostics(),
            Self::Immediate(broker) => broker.diagnostics(),
            Self::Lazy(broker) => broker.diagnostics(),
        }
    }

    /// # Errors
    /// See [`StatefulBroker::modify_items`].
    pub fn modify_items<T: LocatedItem>(&mut self, items: &mut Vec<T>) -> Result<(), BrokerError> {
        match self {
            Self::NoState(broker) => {
                broker.modify_items(items);
                Ok(())
            }
            Self::Immediate(broker) => broker.modify_items(items),
            Self::Lazy(broker) => broker.modify_items(items),
        }
    }

    pub fn before_item(&mut self) -> ItemDirective {
        match self {
            Self::NoState(broker) => broker.before_item(),
            Self::Immediate(broker) => broker.before_item(),
            Self::Lazy(broker) => broker.before_item(),
        }
    }

    /// # Errors
    /// See [`StatefulBroker::report_outcome`].
    pub fn report_outcome(&mut self, location: &Location, state: &str) -> Result<(), BrokerError> {
        match self {
            Self::NoState(broker) => {
                broker.report_outcome(location, state);
                Ok(())
            }
            Self::Immediate(broker) => broker.report_outcome(location, state),
            Self::Lazy(broker) => broker.report_outcome(location, state),
        }
    }

    /// # Errors
    /// See [`StatefulBroker::finish`].
    pub fn finish(&mut self, exit_status: RunExitStatus) -> Result<FinishReport, BrokerError> {
        match self {
            Self::NoState(broker) => broker.finish(exit_status),
            Self::Immediate(broker) => broker.finish(exit_status),
            Self::Lazy(broker) => broker.finish(exit_status),
        }
    }
}
