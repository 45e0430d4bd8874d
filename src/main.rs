//! sparkworker - out-of-process task worker and worker supervisor

mod cli;
mod daemon;
mod error;
mod logging;
mod protocol;
mod worker;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, RunMode};

/// Program entry point: parses the arguments, runs the selected mode and
/// exits with its status.
///
/// Fatal errors print a colored error header followed by each cause in the
/// chain, then exit with the worker failure status.
fn main() {
    let cli = Cli::parse_args();
    logging::init(cli.log_config());

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(worker::EXIT_FAILURE);
        }
    }
}

/// Run the selected mode, returning the exit code.
fn run(cli: &Cli) -> Result<i32> {
    match cli.run_mode() {
        RunMode::Direct(port) => {
            let termination = worker::worker_main::run_direct(port).context("Worker failed")?;
            Ok(termination.exit_code())
        }
        RunMode::Handoff(path) => {
            let termination = daemon::run_handoff(&path)
                .with_context(|| format!("Worker hand-off through {} failed", path.display()))?;
            Ok(termination.exit_code())
        }
        RunMode::Daemon => {
            let config = cli
                .supervisor_config()
                .context("Invalid supervisor configuration")?;
            daemon::run_daemon(config).context("Supervisor failed")?;
            Ok(0)
        }
    }
}
