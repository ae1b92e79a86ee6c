//! Domain types shared by the history store and the samples broker.
//!
//! A test item is identified by its [`Location`]. Outcomes reported by the
//! harness are reduced to a [`ResultAction`] which decides whether the item
//! is written to, dropped from or ignored by the history store.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod hashing;
mod ordering;
mod timeout;

pub use hashing::{hash_file, hash_reader, FileDigest, DIGEST_LEN};
pub use ordering::{count_true_false, move_idx_to_end, move_idx_to_end_by_key};
pub use timeout::{Clock, ItemDirective, SystemClock, TimeoutGovernor, TimeoutState};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("index {index} is out of bounds for a list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("there were duplicate indices: {0}")]
    DuplicateIndex(usize),
}

/// The location of a test item: file path, optional line number and name.
///
/// Two items are the same iff all three fields match. The line number takes
/// part in the identity since parametrized names may repeat.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Location {
    pub file: String,
    pub lineno: Option<u32>,
    pub testname: String,
}

impl Location {
    #[must_use]
    pub fn new(file: impl Into<String>, lineno: Option<u32>, testname: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            lineno,
            testname: testname.into(),
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.lineno {
            Some(lineno) => write!(f, "{}:{}::{}", self.file, lineno, self.testname),
            None => write!(f, "{}::{}", self.file, self.testname),
        }
    }
}

/// A handle the harness hands to the broker. Anything exposing a
/// [`Location`] can be scheduled.
pub trait LocatedItem {
    fn location(&self) -> &Location;
}

impl LocatedItem for Location {
    fn location(&self) -> &Location {
        self
    }
}

/// The result state of a completed test item as reported by the harness.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum TestOutcome {
    Passed,
    /// Unexpectedly passed.
    XPassed,
    /// Expected failure which occurred.
    XFailed,
    Skipped,
    Failed,
    Error,
    Unrecognized(String),
}

impl TestOutcome {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "passed" => Self::Passed,
            "xpassed" => Self::XPassed,
            "xfailed" => Self::XFailed,
            "skipped" => Self::Skipped,
            "failed" => Self::Failed,
            "error" => Self::Error,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Passed => "passed",
            Self::XPassed => "xpassed",
            Self::XFailed => "xfailed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Unrecognized(raw) => raw,
        }
    }

    /// Reduces the outcome to the action taken on the history store.
    #[must_use]
    pub fn action(&self) -> ResultAction {
        match self {
            Self::Passed | Self::XPassed | Self::XFailed => ResultAction::Write,
            Self::Failed | Self::Error => ResultAction::Drop,
            Self::Skipped | Self::Unrecognized(_) => ResultAction::Ignore,
        }
    }
}

impl Display for TestOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultAction {
    /// Counts as a success; record the run.
    Write,
    /// Counts as a failure; remove the item from the store.
    Drop,
    Ignore,
}

/// The exit status of a harness run, following the pytest exit codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunExitStatus {
    AllPassed,
    SomeFailed,
    Interrupted,
    InternalError,
    UsageError,
    NoTestsCollected,
    Other(i32),
}

impl RunExitStatus {
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::AllPassed,
            1 => Self::SomeFailed,
            2 => Self::Interrupted,
            3 => Self::InternalError,
            4 => Self::UsageError,
            5 => Self::NoTestsCollected,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::AllPassed => 0,
            Self::SomeFailed => 1,
            Self::Interrupted => 2,
            Self::InternalError => 3,
            Self::UsageError => 4,
            Self::NoTestsCollected => 5,
            Self::Other(code) => code,
        }
    }

    /// Whether the run terminated abnormally. Reconciliation is skipped for
    /// such runs so partial data never reaches the history store.
    #[must_use]
    pub fn is_abnormal(self) -> bool {
        !matches!(
            self,
            Self::AllPassed | Self::SomeFailed | Self::NoTestsCollected
        )
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CoreError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CoreError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CoreError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
