//! CLI module for aeroflow
//!
//! Offline inspection of configuration and on-disk checkpoint ledgers:
//! - check-config: Validate a configuration file
//! - dump-ledger: Print the marker and entries of one ledger
//! - replay: Fold a chain of ledgers into window state

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, LogFormatArg};
pub use commands::{check_config, dump_ledger, replay, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
