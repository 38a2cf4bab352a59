//! presenced - presence monitoring daemon.

use std::process::ExitCode;

use clap::Parser;
use presence_daemon::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match presence_daemon::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Logging may not be initialized yet.
            eprintln!("presenced: {err:#}");
            tracing::error!(error = format!("{err:#}"), "presence daemon failed");
            ExitCode::FAILURE
        }
    }
}
