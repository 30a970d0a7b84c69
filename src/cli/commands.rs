//! CLI command implementations
//!
//! Every command is read-only: it never seals, appends to or registers a
//! ledger. Ledgers are opened with the password from the configuration
//! (or the default configuration when none is given).

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::checkpoint::{
    marker_path, numeric_sum, FileLogStore, LedgerId, LedgerMarker, LogStore, PlaybackEngine,
    WindowAggregations, WindowState,
};
use crate::config::AeroflowConfig;
use crate::observability::init_logging;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Main CLI entry point
///
/// Parses arguments, installs logging and dispatches to the command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    init_logging("warn", cli.log_format.into())?;

    let result = run_command(cli.command);
    if let Err(e) = &result {
        write_error(e.code_str(), e.message())?;
    }
    result
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let report = match cmd {
        Command::CheckConfig { config } => check_config(&config)?,
        Command::DumpLedger {
            store,
            ledger,
            config,
        } => dump_ledger(&store, ledger, config.as_deref())?,
        Command::Replay {
            store,
            ledgers,
            config,
        } => replay(&store, &ledgers, config.as_deref())?,
    };
    write_response(report)
}

fn open_store(dir: &Path) -> CliResult<Arc<dyn LogStore>> {
    if !dir.is_dir() {
        return Err(CliError::ledger_error(format!(
            "ledger directory not found: {}",
            dir.display()
        )));
    }
    Ok(Arc::new(FileLogStore::open_dir(dir)?))
}

fn load_config(path: Option<&Path>) -> CliResult<AeroflowConfig> {
    match path {
        Some(path) => Ok(AeroflowConfig::load(path)?),
        None => Ok(AeroflowConfig::default()),
    }
}

/// Validate a configuration file and report the effective settings.
///
/// The ledger password is redacted.
pub fn check_config(config_path: &Path) -> CliResult<Value> {
    let config = AeroflowConfig::load(config_path)?;
    let mut value = serde_json::to_value(&config)?;
    if let Some(password) = value.pointer_mut("/checkpoint/ledger_password") {
        *password = Value::String("<redacted>".to_string());
    }
    info!(path = %config_path.display(), "configuration valid");
    Ok(json!({ "valid": true, "config": value }))
}

/// Marker and decoded entries of one ledger.
pub fn dump_ledger(
    store_dir: &Path,
    ledger: LedgerId,
    config_path: Option<&Path>,
) -> CliResult<Value> {
    let config = load_config(config_path)?;
    let store = open_store(store_dir)?;
    let marker = LedgerMarker::read_from_file(&marker_path(store_dir, ledger))?;

    let engine = PlaybackEngine::new(
        store,
        WindowAggregations::new(),
        config.checkpoint.read_chunk_size,
        config.checkpoint.ledger_password.as_bytes().to_vec(),
    );
    let entries = engine.read_segment(ledger)?;
    debug!(ledger, entries = entries.len(), "ledger read");

    let entries: Vec<Value> = entries
        .iter()
        .enumerate()
        .map(|(entry_id, entry)| -> Result<Value, serde_json::Error> {
            Ok(json!({
                "entry_id": entry_id,
                "kind": entry.kind(),
                "entry": serde_json::to_value(entry)?,
            }))
        })
        .collect::<Result<_, _>>()?;

    Ok(json!({
        "ledger": ledger,
        "marker": serde_json::to_value(&marker)?,
        "entries": entries,
    }))
}

/// Replay `ledgers` in order, summing every window numerically.
pub fn replay(
    store_dir: &Path,
    ledgers: &[LedgerId],
    config_path: Option<&Path>,
) -> CliResult<Value> {
    let config = load_config(config_path)?;
    let store = open_store(store_dir)?;

    let engine = PlaybackEngine::new(
        store,
        WindowAggregations::new().with_fallback(false, numeric_sum),
        config.checkpoint.read_chunk_size,
        config.checkpoint.ledger_password.as_bytes().to_vec(),
    );
    let (state, stats) = engine.replay(ledgers, WindowState::new())?;

    Ok(json!({
        "chain": ledgers,
        "stats": serde_json::to_value(&stats)?,
        "state": serde_json::to_value(state.to_compacted())?,
    }))
}
