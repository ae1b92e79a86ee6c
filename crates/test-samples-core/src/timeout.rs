use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Source of monotonic time for elapsed-time comparisons.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// What the harness should do with the item it is about to execute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ItemDirective {
    Run,
    Skip,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimeoutState {
    NotStarted,
    Running { started: Instant },
    Expired,
}

/// Soft deadline for a run, checked only at item boundaries.
///
/// The clock starts on the first checked item. Once the budget is exceeded
/// the item that triggered the check and every later item are skipped.
/// Expiration never resets.
#[derive(Debug)]
pub struct TimeoutGovernor<C = SystemClock> {
    budget: Option<Duration>,
    state: TimeoutState,
    clock: C,
}

impl TimeoutGovernor<SystemClock> {
    #[must_use]
    pub fn new(budget: Option<Duration>) -> Self {
        Self::with_clock(budget, SystemClock)
    }
}

impl<C: Clock> TimeoutGovernor<C> {
    #[must_use]
    pub fn with_clock(budget: Option<Duration>, clock: C) -> Self {
        Self {
            budget,
            state: TimeoutState::NotStarted,
            clock,
        }
    }

    #[must_use]
    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    #[must_use]
    pub fn state(&self) -> TimeoutState {
        self.state
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.state == TimeoutState::Expired
    }

    pub fn check_item(&mut self) -> ItemDirective {
        let Some(budget) = self.budget else {
            return ItemDirective::Run;
        };

        match self.state {
            TimeoutState::Expired => ItemDirective::Skip,
            TimeoutState::NotStarted => {
                self.state = TimeoutState::Running {
                    started: self.clock.now(),
                };
                tracing::info!(?budget, "soft timeout clock started");
                ItemDirective::Run
            }
            TimeoutState::Running { started } => {
                let elapsed = self.clock.now().saturating_duration_since(started);
                if elapsed >= budget {
                    tracing::info!(?budget, ?elapsed, "soft timeout expired");
                    self.state = TimeoutState::Expired;
                    ItemDirective::Skip
                } else {
                    ItemDirective::Run
                }
            }
        }
    }
}
