use std::path::Path;

use test_samples_store_sqlite::Engine;
use tracing::{error, warn};

use crate::BrokerError;

/// Opens the store at `path` and sets up its tables.
///
/// A file failing setup is fatal unless `overwrite` is set, in which case
/// it is truncated once and set up exactly once more. The engine is
/// disposed before any error is returned.
///
/// # Errors
/// Returns [`BrokerError::Usage`] for an unusable path or a broken file
/// that could not be recovered.
pub fn open_store(path: &Path, overwrite: bool) -> Result<Engine, BrokerError> {
    let engine = Engine::open(path).map_err(|err| {
        error!(error = %err, "failed to initialize the history database engine");
        BrokerError::usage_with(err.to_string(), err)
    })?;

    if let Err(err) = setup_tables(&engine, overwrite) {
        if let Err(dispose_err) = engine.dispose() {
            error!(error = %dispose_err, "failed to dispose the history database engine");
        }
        return Err(err);
    }
    Ok(engine)
}

fn setup_tables(engine: &Engine, overwrite: bool) -> Result<(), BrokerError> {
    let first = match engine.setup_tables() {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    error!(error = %first, "setting up the history tables failed");

    if !overwrite {
        return Err(BrokerError::usage_with(
            "the provided database file is invalid",
            first,
        ));
    }

    warn!(path = %engine.path().display(), "overwriting the broken history database");
    engine
        .truncate_database_file()
        .map_err(|err| BrokerError::usage_with("truncating the broken database file failed", err))?;

    engine.setup_tables().map_err(|err| {
        error!(error = %err, "setting up the history tables failed after truncation");
        BrokerError::usage_with(
            "the provided database file is invalid and truncating it did not resolve the issue",
            err,
        )
    })
}
