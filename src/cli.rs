//! Command-line interface definitions using clap.

use crate::daemon::{SpawnStrategy, SupervisorConfig};
use crate::error::Result;
use crate::logging::{LogConfig, LogFormat};
use clap::{ArgGroup, Parser, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Out-of-process task worker for a cluster compute engine.
#[derive(Parser, Debug)]
#[command(name = "sparkworker")]
#[command(author, version, about, long_about = None)]
#[command(override_usage = "sparkworker [OPTIONS] <--module <MODULE>|--port <PORT>>")]
#[command(group(
    ArgGroup::new("mode")
        .multiple(false)
        .args(["module", "port", "handoff"])
))]
pub struct Cli {
    /// Module to run: the task worker or the worker supervisor.
    #[arg(
        short = 'm',
        long,
        value_enum,
        value_name = "MODULE",
        required_unless_present_any = ["port", "handoff"]
    )]
    pub module: Option<Module>,

    /// Connect directly to an orchestrator listening on this loopback port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Receive the connection from the supervisor over this Unix socket.
    #[arg(long, hide = true, value_name = "PATH")]
    pub handoff: Option<PathBuf>,

    /// How the supervisor hands connections to workers.
    #[arg(long, value_enum, env = "SPARKWORKER_STRATEGY")]
    pub strategy: Option<SpawnStrategy>,

    /// Longest time the supervisor blocks waiting for a connection (ms).
    #[arg(long, env = "SPARKWORKER_POLL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// How long a spawned worker has to collect its connection (ms).
    #[arg(long, default_value_t = 10_000)]
    pub handoff_timeout_ms: u64,

    /// Enable verbose logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log errors only.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Module names the orchestrator launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Module {
    /// Run one task worker.
    #[value(name = "pyspark.worker", alias = "worker")]
    Worker,
    /// Run the worker supervisor.
    #[value(name = "pyspark.daemon", alias = "daemon")]
    Daemon,
}

/// What the process runs, resolved from the arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Worker connecting to the orchestrator itself. `None` reads the port
    /// from stdin.
    Direct(Option<u16>),
    Daemon,
    Handoff(PathBuf),
}

impl Cli {
    /// Parse the process arguments, accepting the orchestrator's single-dash
    /// `-port` spelling.
    pub fn parse_args() -> Self {
        Self::parse_from(normalize_args(std::env::args_os()))
    }

    pub fn run_mode(&self) -> RunMode {
        if let Some(path) = &self.handoff {
            RunMode::Handoff(path.clone())
        } else if let Some(port) = self.port {
            RunMode::Direct(Some(port))
        } else {
            match self.module {
                Some(Module::Daemon) => RunMode::Daemon,
                Some(Module::Worker) | None => RunMode::Direct(None),
            }
        }
    }

    /// Log level requested on the command line, if any.
    fn cli_level(&self) -> Option<Level> {
        match (self.quiet, self.verbose) {
            (true, _) => Some(Level::ERROR),
            (false, 0) => None,
            (false, 1) => Some(Level::DEBUG),
            (false, _) => Some(Level::TRACE),
        }
    }

    /// Logging configuration: command-line flags first, then environment.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::default();
        if let Some(level) = self.cli_level() {
            config = config
                .with_level(level)
                .with_filter(level.to_string().to_lowercase());
        }
        config = config.with_env_overrides();
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone());
        }
        config
    }

    pub fn supervisor_config(&self) -> Result<SupervisorConfig> {
        let strategy = self.strategy.unwrap_or_else(SpawnStrategy::platform_default);
        Ok(SupervisorConfig::new(strategy)?
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_handoff_timeout(Duration::from_millis(self.handoff_timeout_ms)))
    }
}

/// Rewrite `-port` to `--port`.
pub fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some("-port") => OsString::from("--port"),
            Some(s) if s.starts_with("-port=") => OsString::from(format!("-{}", s)),
            _ => arg,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        let args = std::iter::once("sparkworker")
            .chain(args.iter().copied())
            .map(OsString::from);
        Cli::try_parse_from(normalize_args(args))
    }

    #[test]
    fn test_normalize_args() {
        let args = ["sparkworker", "-port", "4000", "-port=5", "-m", "-v"]
            .into_iter()
            .map(OsString::from);
        assert_eq!(
            normalize_args(args),
            vec!["sparkworker", "--port", "4000", "--port=5", "-m", "-v"]
        );
    }

    #[test]
    fn test_port_selects_direct_worker() {
        let cli = parse(&["-port", "41234"]).unwrap();
        assert_eq!(cli.run_mode(), RunMode::Direct(Some(41234)));
    }

    #[test]
    fn test_module_names() {
        let cli = parse(&["-m", "pyspark.worker"]).unwrap();
        assert_eq!(cli.run_mode(), RunMode::Direct(None));

        let cli = parse(&["-m", "pyspark.daemon"]).unwrap();
        assert_eq!(cli.run_mode(), RunMode::Daemon);

        let cli = parse(&["-m", "daemon"]).unwrap();
        assert_eq!(cli.module, Some(Module::Daemon));

        assert!(parse(&["-m", "pyspark.shell"]).is_err());
    }

    #[test]
    fn test_mode_is_required_and_exclusive() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["-m", "pyspark.daemon", "-port", "1"]).is_err());
        assert!(parse(&["--handoff", "/tmp/h.sock", "-port", "1"]).is_err());
    }

    #[test]
    fn test_handoff_stays_out_of_help() {
        let mut command = Cli::command();
        let usage = command.render_usage().to_string();
        let help = command.render_long_help().to_string();
        assert!(usage.contains("--module <MODULE>"));
        assert!(!usage.contains("--handoff"));
        assert!(!help.contains("--handoff <"));
    }

    #[test]
    fn test_handoff_mode() {
        let cli = parse(&["--handoff", "/tmp/h.sock"]).unwrap();
        assert_eq!(cli.run_mode(), RunMode::Handoff(PathBuf::from("/tmp/h.sock")));
    }

    #[test]
    fn test_strategy_and_intervals() {
        let cli = parse(&[
            "-m",
            "pyspark.daemon",
            "--strategy",
            "spawn",
            "--poll-interval-ms",
            "20",
        ])
        .unwrap();
        assert_eq!(cli.strategy, Some(SpawnStrategy::Spawn));
        let config = cli.supervisor_config().unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.handoff.strategy, SpawnStrategy::Spawn);
    }

    #[test]
    fn test_verbosity_sets_filter() {
        let cli = parse(&["-port", "1", "-vv"]).unwrap();
        let config = cli.log_config();
        assert_eq!(config.level, Level::TRACE);
        assert_eq!(config.filter.as_deref(), Some("trace"));

        let cli = parse(&["-port", "1", "-q"]).unwrap();
        assert_eq!(cli.log_config().level, Level::ERROR);
    }

    #[test]
    fn test_log_flags_override_env() {
        let cli = parse(&["-port", "1", "--log-format", "json", "--log-file", "/tmp/w.log"])
            .unwrap();
        let config = cli.log_config();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/w.log")));
    }
}
