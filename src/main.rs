//! aeroflow CLI entry point
//!
//! Parses arguments and dispatches through `cli::run`. Errors are reported
//! as JSON on stdout by the command layer and as text on stderr here; the
//! process exits non-zero on failure.

use aeroflow::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
