//! Worker process supervisor.
//!
//! Keeps a loopback listener open for the orchestrator and gives every
//! accepted connection its own worker process.
//!
//! # Architecture
//!
//! ```text
//!   orchestrator ──stdin (kill pids)──► control thread ──mpsc──┐
//!        │                                                     ▼
//!        └──connect──► listener ──accept──► Supervisor::run ──► WorkerTable
//!                                              │
//!                             ┌────────────────┼────────────────┐
//!                       ┌─────▼─────┐    ┌─────▼─────┐    ┌─────▼─────┐
//!                       │ Worker 1  │    │ Worker 2  │    │ Worker N  │
//!                       │ (process) │    │ (process) │    │ (process) │
//!                       └───────────┘    └───────────┘    └───────────┘
//! ```
//!
//! The port is reported once on stdout. Closing stdin shuts the supervisor
//! down and kills every worker it still tracks.

mod control;
mod pool;
mod proc;
mod signals;
mod spawn;

pub use pool::SupervisorConfig;
pub use spawn::SpawnStrategy;

use control::spawn_control_reader;
use pool::Supervisor;

use crate::error::Result;
use crate::worker::function::FunctionRegistry;
use crate::worker::session::{SessionConfig, Termination};
use crate::worker::worker_main;
use std::path::Path;
use std::sync::Arc;

/// Run the supervisor until its control channel closes.
pub fn run_daemon(config: SupervisorConfig) -> Result<()> {
    worker_main::ignore_sigpipe();
    let mut supervisor = Supervisor::bind(config, Arc::new(FunctionRegistry::with_builtins()))?;
    supervisor.report_port(&mut std::io::stdout().lock())?;
    let (commands, _reader) = spawn_control_reader(std::io::stdin())?;
    supervisor.run(&commands)
}

/// Run a spawned worker that receives its connection over `path`.
pub fn run_handoff(path: &Path) -> Result<Termination> {
    worker_main::ignore_sigpipe();
    let stream = spawn::receive_connection(path)?;
    worker_main::serve_stream(
        stream,
        Arc::new(FunctionRegistry::with_builtins()),
        SessionConfig::from_env(),
        true,
    )
}
