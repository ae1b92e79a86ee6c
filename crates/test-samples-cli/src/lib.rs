//! Command line surface over the test sample history store and the broker.
//!
//! Store maintenance commands (`init`, `stats`, `show`, `reset`) operate on
//! the database given by `--db`. `run` simulates one harness run: it feeds a
//! collected item list through the broker, reports recorded outcomes and
//! prints what the broker did as JSON.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use test_samples_broker::{
    open_store, parse_soft_timeout, Broker, BrokerConfig, BrokerDiagnostic, Mode, WriteMode,
};
use test_samples_core::{format_rfc3339, ItemDirective, Location, RunExitStatus};
use test_samples_store_sqlite::{Engine, StoreCounts};
use tracing::{info, warn};

/// Log target of the history store crate, raised to `debug` by `--db-log`.
pub const STORE_LOG_TARGET: &str = "test_samples_store_sqlite";

#[derive(Debug, Parser)]
#[command(name = "samples")]
#[command(about = "Test sampling history CLI")]
pub struct Cli {
    /// History database file. Relative paths resolve against the current
    /// directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// `tracing` filter directives for diagnostics on stderr.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log every statement issued against the history store.
    #[arg(long, global = true)]
    db_log: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// The filter directives to install, with the store target raised when
    /// `--db-log` is set.
    #[must_use]
    pub fn log_directives(&self) -> String {
        if self.db_log {
            format!("{},{STORE_LOG_TARGET}=debug", self.log_level)
        } else {
            self.log_level.clone()
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Creates the history tables, optionally recovering a broken file.
    Init(InitArgs),
    /// Counts stored files and items.
    Stats(StatsArgs),
    /// Lists every stored item with its last successful run.
    Show,
    /// Drops every stored file and item.
    Reset,
    /// Runs a collected item list through the broker.
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct InitArgs {
    #[arg(long)]
    overwrite_broken_db: bool,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// JSON array of collected locations, in collection order.
    #[arg(long)]
    items: PathBuf,
    /// JSON array of `{file, lineno, testname, outcome}` reports. Executed
    /// items without a report count as skipped.
    #[arg(long)]
    results: Option<PathBuf>,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    exit_status: i32,
    #[arg(long, value_enum, default_value = "nostate")]
    mode: ModeArg,
    #[arg(long)]
    seed: Option<String>,
    /// Accepts a seed in nostate mode without a diagnostic.
    #[arg(long)]
    nostate_seeded: bool,
    /// Soft timeout such as `50m` or `1h 30m`; `off` disables it.
    #[arg(long, default_value = "50m")]
    soft_timeout: String,
    #[arg(long)]
    hash_testfiles: bool,
    /// Directory test file paths resolve against. Defaults to the current
    /// directory.
    #[arg(long)]
    rootpath: Option<PathBuf>,
    #[arg(long)]
    randomize: bool,
    #[arg(long)]
    no_pruning: bool,
    #[arg(long)]
    reset_on_saturation: bool,
    #[arg(long)]
    overwrite_broken_db: bool,
    #[arg(long)]
    write_immediately: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Nostate,
    Stateful,
}

#[derive(Debug, Deserialize)]
struct ReportedOutcome {
    #[serde(flatten)]
    location: Location,
    outcome: String,
}

#[derive(Debug, Serialize)]
struct StoredItemView {
    file: String,
    lineno: Option<u32>,
    testname: String,
    last_run: String,
}

#[derive(Debug, Serialize)]
struct ReconciliationView {
    kind: &'static str,
    summary: String,
}

#[derive(Debug, Serialize)]
struct RunReport {
    seed: String,
    order: Vec<Location>,
    executed: Vec<Location>,
    skipped_by_timeout: Vec<Location>,
    reconciliation: ReconciliationView,
    passed: usize,
    failed: usize,
    diagnostics: Vec<BrokerDiagnostic>,
}

/// Executes the parsed CLI command.
///
/// # Errors
/// Returns an error when the database cannot be opened, an input file is
/// unreadable, or the broker rejects its configuration or fails a store
/// write.
pub fn run_cli(cli: Cli) -> Result<()> {
    let db = cli.db.as_deref().map(resolve_path).transpose()?;
    match cli.command {
        Command::Init(args) => {
            let db = require_db(db.as_deref())?;
            with_store(db, args.overwrite_broken_db, |_| Ok(()))?;
            let payload = serde_json::json!({
                "db": db.display().to_string(),
                "status": "ready",
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Command::Stats(args) => {
            let counts = with_store(require_db(db.as_deref())?, false, |engine| {
                Ok(engine.with_session(|session| session.counts())?)
            })?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&counts_json(counts))?);
            } else {
                println!("files={} items={}", counts.files, counts.items);
            }
            Ok(())
        }
        Command::Show => {
            let items = with_store(require_db(db.as_deref())?, false, |engine| {
                Ok(engine.with_session(|session| session.list_items())?)
            })?;
            let views = items
                .into_iter()
                .map(|item| {
                    Ok(StoredItemView {
                        file: item.location.file,
                        lineno: item.location.lineno,
                        testname: item.location.testname,
                        last_run: format_rfc3339(item.last_run)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&views)?);
            Ok(())
        }
        Command::Reset => {
            let dropped = with_store(require_db(db.as_deref())?, false, |engine| {
                Ok(engine.with_session(|session| session.drop_all_entries())?)
            })?;
            let payload = serde_json::json!({
                "files_dropped": dropped.files_dropped,
                "tests_dropped": dropped.tests_dropped,
                "summary": dropped.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Command::Run(args) => {
            let report = run_samples(db, &args)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn resolve_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to resolve the current directory")?;
    Ok(cwd.join(path))
}

fn require_db(db: Option<&Path>) -> Result<&Path> {
    db.ok_or_else(|| anyhow!("this command requires --db <path>"))
}

/// Opens the store, runs `f` against it and disposes the engine whether or
/// not `f` succeeded.
fn with_store<T>(db: &Path, overwrite: bool, f: impl FnOnce(&Engine) -> Result<T>) -> Result<T> {
    let engine = open_store(db, overwrite)
        .with_context(|| format!("failed to open history database {}", db.display()))?;
    let result = f(&engine);
    if let Err(err) = engine.dispose() {
        warn!(error = %err, "failed to dispose the history database engine");
    }
    result
}

fn counts_json(counts: StoreCounts) -> serde_json::Value {
    serde_json::json!({
        "files": counts.files,
        "items": counts.items,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

impl RunArgs {
    fn broker_config(&self, db: Option<PathBuf>) -> Result<BrokerConfig> {
        let rootpath = match &self.rootpath {
            Some(path) => resolve_path(path)?,
            None => std::env::current_dir().context("failed to resolve the current directory")?,
        };
        Ok(BrokerConfig {
            mode: match self.mode {
                ModeArg::Nostate => Mode::NoState,
                ModeArg::Stateful => Mode::Stateful,
            },
            db_path: db,
            rootpath,
            soft_timeout: parse_soft_timeout(&self.soft_timeout)?,
            seed: self.seed.clone(),
            nostate_seeded: self.nostate_seeded,
            hash_testfiles: self.hash_testfiles,
            randomize: self.randomize,
            no_pruning: self.no_pruning,
            reset_on_saturation: self.reset_on_saturation,
            overwrite_broken_db: self.overwrite_broken_db,
            write_mode: if self.write_immediately {
                WriteMode::Immediate
            } else {
                WriteMode::Lazy
            },
        })
    }
}

fn run_samples(db: Option<PathBuf>, args: &RunArgs) -> Result<RunReport> {
    let mut items: Vec<Location> = read_json(&args.items)?;
    let reported: Vec<ReportedOutcome> = match &args.results {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let mut outcomes: HashMap<Location, Vec<String>> = HashMap::new();
    for entry in reported {
        outcomes
            .entry(entry.location)
            .or_default()
            .push(entry.outcome);
    }

    let config = args.broker_config(db)?;
    let mut broker = Broker::from_config(&config)?;
    broker.modify_items(&mut items)?;
    info!(count = items.len(), seed = broker.seed(), "items ordered");

    let mut executed = Vec::new();
    let mut skipped_by_timeout = Vec::new();
    for location in &items {
        if broker.before_item() == ItemDirective::Skip {
            skipped_by_timeout.push(location.clone());
            continue;
        }
        executed.push(location.clone());
        let states = outcomes.get(location).map_or(&[][..], Vec::as_slice);
        let reports = if states.is_empty() {
            broker.report_outcome(location, "skipped")
        } else {
            states
                .iter()
                .try_for_each(|state| broker.report_outcome(location, state))
        };
        if let Err(err) = reports {
            if let Err(finish_err) = broker.finish(RunExitStatus::InternalError) {
                warn!(error = %finish_err, "failed to finish the aborted run");
            }
            return Err(err).with_context(|| format!("failed to record the outcome of {location}"));
        }
    }

    let seed = broker.seed().to_string();
    let report = broker.finish(RunExitStatus::from_code(args.exit_status))?;
    Ok(RunReport {
        seed,
        order: items,
        executed,
        skipped_by_timeout,
        reconciliation: ReconciliationView {
            kind: report.reconciliation.kind(),
            summary: report.reconciliation.to_string(),
        },
        passed: report.counts.passed,
        failed: report.counts.failed,
        diagnostics: report.diagnostics,
    })
}
