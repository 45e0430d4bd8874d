//! Worker process entry points.
//!
//! Runs when the binary is started as a direct worker (`-port <n>` or
//! `-m pyspark.worker`), when the supervisor hands a connection to a
//! spawned worker (`--handoff <path>`), and inside a forked supervisor child.

use super::EXIT_FAILURE;
use super::function::FunctionRegistry;
use super::session::{Session, SessionConfig, Termination};
use crate::error::{Result, WorkerError};
use std::io::{self, BufRead, BufReader, BufWriter};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Read the orchestrator's port from the first line of `input`.
pub fn read_port_line(input: &mut impl BufRead) -> Result<u16> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(WorkerError::protocol("no port received on stdin"));
    }
    line.trim()
        .parse()
        .map_err(|_| WorkerError::protocol(format!("invalid port '{}'", line.trim())))
}

/// Connect to the orchestrator listening on loopback `port`.
pub fn connect(port: u16) -> Result<TcpStream> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    debug!(%addr, "Connecting to orchestrator");
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Ignore SIGPIPE; a closed peer surfaces as an `io::Error` instead.
pub fn ignore_sigpipe() {
    // Safety: installing SIG_IGN has no handler code that could run unsafely.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }
}

/// Serve tasks on `stream` until the session terminates.
///
/// With `announce` set, the process id is written first, which is how a
/// supervised worker identifies itself to the orchestrator.
pub fn serve_stream(
    stream: TcpStream,
    functions: Arc<FunctionRegistry>,
    config: SessionConfig,
    announce: bool,
) -> Result<Termination> {
    let peer = stream.peer_addr().ok();
    let reader = BufReader::new(stream.try_clone()?);
    let writer = BufWriter::new(stream);
    let mut session = Session::new(reader, writer, functions, config);
    info!(pid = std::process::id(), ?peer, reuse = config.reuse, "Worker started");

    if announce {
        session.announce_pid()?;
    }
    let termination = session.serve()?;
    info!(
        tasks = session.tasks_run(),
        ?termination,
        "Worker finished"
    );
    Ok(termination)
}

/// Exit code for the outcome of [`serve_stream`] in a forked worker.
pub fn exit_code(result: Result<Termination>) -> i32 {
    match result {
        Ok(termination) => termination.exit_code(),
        Err(e) => {
            error!(error = %e, "Worker failed");
            EXIT_FAILURE
        }
    }
}

/// Run a direct worker connected to `port`, or to the port read from stdin.
pub fn run_direct(port: Option<u16>) -> Result<Termination> {
    ignore_sigpipe();
    let port = match port {
        Some(port) => port,
        None => read_port_line(&mut io::stdin().lock())?,
    };
    let stream = connect(port)?;
    serve_stream(
        stream,
        Arc::new(FunctionRegistry::with_builtins()),
        SessionConfig::from_env(),
        false,
    )
}
