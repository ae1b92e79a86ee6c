use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::{BrokerDiagnostic, BrokerError};

pub const DEFAULT_SOFT_TIMEOUT: Duration = Duration::from_secs(50 * 60);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub enum Mode {
    /// Shuffle only, nothing is persisted.
    #[default]
    #[serde(rename = "nostate")]
    NoState,
    #[serde(rename = "stateful")]
    Stateful,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Every outcome is written as soon as it is reported.
    Immediate,
    /// Outcomes are buffered and written in one transaction at finish.
    #[default]
    Lazy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub mode: Mode,
    pub db_path: Option<PathBuf>,
    /// Directory relative test file paths are resolved against.
    pub rootpath: PathBuf,
    /// `None` disables the soft timeout.
    pub soft_timeout: Option<Duration>,
    pub seed: Option<String>,
    pub nostate_seeded: bool,
    pub hash_testfiles: bool,
    pub randomize: bool,
    pub no_pruning: bool,
    pub reset_on_saturation: bool,
    pub overwrite_broken_db: bool,
    pub write_mode: WriteMode,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::NoState,
            db_path: None,
            rootpath: PathBuf::from("."),
            soft_timeout: Some(DEFAULT_SOFT_TIMEOUT),
            seed: None,
            nostate_seeded: false,
            hash_testfiles: false,
            randomize: false,
            no_pruning: false,
            reset_on_saturation: false,
            overwrite_broken_db: false,
            write_mode: WriteMode::Lazy,
        }
    }
}

impl BrokerConfig {
    /// Checks the mode specific constraints. Returns the non-fatal
    /// diagnostics the configuration produced.
    ///
    /// # Errors
    /// Returns [`BrokerError::Usage`] when a database path is set in
    /// nostate mode or missing in stateful mode.
    pub fn validate(&self) -> Result<Vec<BrokerDiagnostic>, BrokerError> {
        let mut diagnostics = Vec::new();
        match self.mode {
            Mode::NoState => {
                if self.db_path.is_some() {
                    return Err(BrokerError::usage(
                        "the mode was set to nostate, but a database path was provided",
                    ));
                }
                if self.seed.is_some() && !self.nostate_seeded {
                    tracing::warn!(
                        "a seed value was provided in nostate mode; every run will use the same order"
                    );
                    diagnostics.push(BrokerDiagnostic::SeedSetInNoStateMode);
                }
            }
            Mode::Stateful => {
                if self.db_path.is_none() {
                    return Err(BrokerError::usage(
                        "the mode was set to stateful, but no database path was provided",
                    ));
                }
            }
        }
        Ok(diagnostics)
    }

    /// The configured seed, or a time based one when none was given.
    #[must_use]
    pub fn resolve_seed(&self) -> String {
        if let Some(seed) = &self.seed {
            info!(seed = %seed, "using the configured RNG seed");
            return seed.clone();
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default()
            .to_string();
        info!(seed = %seed, "no seed provided, using the current time");
        seed
    }
}

/// Parses a soft timeout such as `50m` or `1h 30m`. The literal `off`
/// disables the timeout.
///
/// # Errors
/// Returns [`BrokerError::Usage`] for anything `humantime` cannot parse.
pub fn parse_soft_timeout(value: &str) -> Result<Option<Duration>, BrokerError> {
    let value = value.trim();
    if value == "off" {
        return Ok(None);
    }
    humantime::parse_duration(value).map(Some).map_err(|err| {
        BrokerError::usage(format!(
            "could not parse a valid time delta from {value:?}: {err}"
        ))
    })
}

/// Builds the shuffling RNG. Identical seeds give identical sequences.
#[must_use]
pub fn seeded_rng(seed: &str) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(xxh3_64(seed.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_timeout_parses_durations_and_off() {
        assert!(matches!(parse_soft_timeout("off"), Ok(None)));
        assert!(matches!(
            parse_soft_timeout("50m"),
            Ok(Some(duration)) if duration == DEFAULT_SOFT_TIMEOUT
        ));
        assert!(matches!(
            parse_soft_timeout(" 1h 30s "),
            Ok(Some(duration)) if duration == Duration::from_secs(3630)
        ));
        assert!(matches!(parse_soft_timeout("0s"), Ok(Some(Duration::ZERO))));
        assert!(matches!(
            parse_soft_timeout("soon"),
            Err(BrokerError::Usage { .. })
        ));
    }

    #[test]
    fn nostate_mode_rejects_a_database_path() {
        let config = BrokerConfig {
            db_path: Some(PathBuf::from("/tmp/samples.sqlite3")),
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(BrokerError::Usage { .. })));
    }

    #[test]
    fn stateful_mode_requires_a_database_path() {
        let config = BrokerConfig {
            mode: Mode::Stateful,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(BrokerError::Usage { .. })));
    }

    #[test]
    fn seed_in_nostate_mode_warns_unless_acknowledged() {
        let seeded = BrokerConfig {
            seed: Some("abc".to_string()),
            ..BrokerConfig::default()
        };
        assert!(matches!(
            seeded.validate().as_deref(),
            Ok([BrokerDiagnostic::SeedSetInNoStateMode])
        ));

        let acknowledged = BrokerConfig {
            nostate_seeded: true,
            ..seeded
        };
        assert!(matches!(acknowledged.validate().as_deref(), Ok([])));
    }

    #[test]
    fn same_seed_gives_same_sequence() {
        use rand::seq::SliceRandom;

        let mut first: Vec<u32> = (0..32).collect();
        let mut second = first.clone();
        first.shuffle(&mut seeded_rng("run-42"));
        second.shuffle(&mut seeded_rng("run-42"));
        assert_eq!(first, second);

        let mut other: Vec<u32> = (0..32).collect();
        other.shuffle(&mut seeded_rng("run-43"));
        assert_ne!(first, other);
    }

    #[test]
    fn configured_seed_is_used_verbatim() {
        let config = BrokerConfig {
            seed: Some("fixed".to_string()),
            ..BrokerConfig::default()
        };
        assert_eq!(config.resolve_seed(), "fixed");
        assert!(!BrokerConfig::default().resolve_seed().is_empty());
    }
}
