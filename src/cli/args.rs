//! CLI argument definitions using clap
//!
//! Commands:
//! - aeroflow check-config --config <path>
//! - aeroflow dump-ledger --store <dir> --ledger <id> [--config <path>]
//! - aeroflow replay --store <dir> --ledgers <id,id,...> [--config <path>]

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::observability::LogFormat;

/// aeroflow - inspect checkpoint logs and configuration
#[derive(Parser, Debug)]
#[command(name = "aeroflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text, global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./aeroflow.json")]
        config: PathBuf,
    },

    /// Print every entry of one on-disk ledger
    DumpLedger {
        /// Ledger directory
        #[arg(long)]
        store: PathBuf,

        /// Ledger id
        #[arg(long)]
        ledger: u64,

        /// Configuration supplying the ledger password
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Replay a chain of on-disk ledgers and print the resulting state
    Replay {
        /// Ledger directory
        #[arg(long)]
        store: PathBuf,

        /// Ledger ids in chain order
        #[arg(long, value_delimiter = ',', required = true)]
        ledgers: Vec<u64>,

        /// Configuration supplying the ledger password and read chunk size
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_ledger_list() {
        let cli = Cli::try_parse_from([
            "aeroflow", "replay", "--store", "/tmp/ledgers", "--ledgers", "3,1,2",
        ])
        .unwrap();
        match cli.command {
            Command::Replay { ledgers, config, .. } => {
                assert_eq!(ledgers, vec![3, 1, 2]);
                assert!(config.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.log_format, LogFormatArg::Text);
    }

    #[test]
    fn test_dump_ledger_requires_id() {
        assert!(Cli::try_parse_from(["aeroflow", "dump-ledger", "--store", "/tmp"]).is_err());
    }

    #[test]
    fn test_global_log_format() {
        let cli =
            Cli::try_parse_from(["aeroflow", "check-config", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormatArg::Json);
    }
}
