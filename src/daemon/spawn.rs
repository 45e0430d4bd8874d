//! Handing an accepted connection to a worker process.
//!
//! Two strategies, chosen per platform:
//!
//! - **Fork** (Linux default): the supervisor forks; the child runs the task
//!   loop on the inherited socket and exits.
//! - **Spawn** (elsewhere): the current executable is started with
//!   `--handoff <path>`, connects back over a Unix-domain socket and receives
//!   the TCP socket's descriptor with `SCM_RIGHTS`.
//!
//! The worker ends up holding the same connection either way.

use super::proc::WorkerProc;
use crate::error::{Result, WorkerError};
use crate::worker::function::FunctionRegistry;
use crate::worker::session::SessionConfig;
use crate::worker::worker_main;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{IoSlice, IoSliceMut};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How a connection reaches its worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SpawnStrategy {
    /// Fork the supervisor; the child serves the inherited socket.
    Fork,
    /// Start a fresh worker executable and pass it the socket descriptor.
    Spawn,
}

impl SpawnStrategy {
    /// Preferred strategy for the target platform.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Fork
        } else {
            Self::Spawn
        }
    }
}

impl std::fmt::Display for SpawnStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fork => write!(f, "fork"),
            Self::Spawn => write!(f, "spawn"),
        }
    }
}

/// Settings shared by every hand-off.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub strategy: SpawnStrategy,
    /// How long a spawned worker has to connect back.
    pub timeout: Duration,
    /// Executable started by the spawn strategy.
    pub executable: PathBuf,
    /// Session options for forked workers. Spawned workers read their own
    /// environment.
    pub session: SessionConfig,
}

impl HandoffConfig {
    pub fn new(strategy: SpawnStrategy) -> Result<Self> {
        let executable = std::env::current_exe().map_err(|e| {
            WorkerError::Supervisor(format!("failed to get current executable: {}", e))
        })?;
        Ok(Self {
            strategy,
            timeout: Duration::from_secs(10),
            executable,
            session: SessionConfig::from_env(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Move `stream` into a new worker process and return its handle.
///
/// The supervisor's copy of the socket is closed before returning, so the
/// connection lives on only in the worker.
pub fn transfer_connection(
    stream: TcpStream,
    listener: &TcpListener,
    functions: &Arc<FunctionRegistry>,
    config: &HandoffConfig,
) -> Result<WorkerProc> {
    match config.strategy {
        SpawnStrategy::Fork => fork_worker(stream, listener, functions, config.session),
        SpawnStrategy::Spawn => spawn_worker(stream, config),
    }
}

fn fork_worker(
    stream: TcpStream,
    listener: &TcpListener,
    functions: &Arc<FunctionRegistry>,
    session: SessionConfig,
) -> Result<WorkerProc> {
    use nix::unistd::{ForkResult, fork};

    // Safety: the child only runs the single-threaded task loop and leaves
    // through `process::exit`. The control reader is the only other thread
    // alive at this point and it takes no locks the child uses (it never
    // logs and only touches its own channel end).
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            debug!(pid = %child, "Forked worker");
            drop(stream);
            Ok(WorkerProc::new(child))
        }
        ForkResult::Child => {
            // Safety: the inherited listener is never used or dropped in the
            // child, so its descriptor is closed exactly once here.
            drop(unsafe { OwnedFd::from_raw_fd(listener.as_raw_fd()) });
            let result =
                worker_main::serve_stream(stream, Arc::clone(functions), session, true);
            std::process::exit(worker_main::exit_code(result));
        }
    }
}

static HANDOFF_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Unique path for a hand-off socket.
fn handoff_path() -> PathBuf {
    let n = HANDOFF_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("sparkworker-{}-{}.sock", std::process::id(), n))
}

/// Removes the hand-off socket file when the transfer is over.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn spawn_worker(stream: TcpStream, config: &HandoffConfig) -> Result<WorkerProc> {
    let path = handoff_path();
    let listener = UnixListener::bind(&path)
        .map_err(|e| WorkerError::Handoff(format!("bind {}: {}", path.display(), e)))?;
    let _socket_file = SocketFile(path.clone());

    let child = Command::new(&config.executable)
        .arg("--handoff")
        .arg(&path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| WorkerError::Handoff(format!("failed to spawn worker: {}", e)))?;
    let mut proc = WorkerProc::from_child(&child);
    debug!(pid = %proc.pid(), path = %path.display(), "Spawned worker");

    let sent = accept_within(&listener, config.timeout)
        .and_then(|channel| send_fd(&channel, stream.as_raw_fd()));
    if let Err(e) = sent {
        let _ = proc.kill();
        return Err(e);
    }
    drop(stream);
    Ok(proc)
}

/// Accept one connection on `listener`, giving up after `timeout`.
fn accept_within(listener: &UnixListener, timeout: Duration) -> Result<UnixStream> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WorkerError::Handoff(format!(
                "worker did not connect within {:?}",
                timeout
            )));
        }
        let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => continue,
            Ok(_) => {
                let (channel, _) = listener.accept()?;
                return Ok(channel);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Send one descriptor over a Unix-domain socket.
pub fn send_fd(channel: &UnixStream, fd: RawFd) -> Result<()> {
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    // At least one byte of regular data must accompany the descriptor.
    let iov = [IoSlice::new(&[0u8])];
    sendmsg::<()>(channel.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    Ok(())
}

/// Receive one descriptor sent by [`send_fd`].
pub fn recv_fd(channel: &UnixStream) -> Result<OwnedFd> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg_buffer = nix::cmsg_space!(RawFd);
    let msg = recvmsg::<()>(
        channel.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;

    let mut received = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            received.extend(fds);
        }
    }
    // Safety: descriptors delivered by SCM_RIGHTS are new and owned by us.
    let mut owned: Vec<OwnedFd> = received
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();
    match owned.len() {
        1 => Ok(owned.remove(0)),
        0 => Err(WorkerError::Handoff("no descriptor received".to_string())),
        n => Err(WorkerError::Handoff(format!(
            "expected one descriptor, received {}",
            n
        ))),
    }
}

/// Worker side of the spawn strategy: connect to `path` and take over the
/// connection sent there.
pub fn receive_connection(path: &Path) -> Result<TcpStream> {
    let channel = UnixStream::connect(path)
        .map_err(|e| WorkerError::Handoff(format!("connect {}: {}", path.display(), e)))?;
    let fd = recv_fd(&channel)?;
    let stream = TcpStream::from(fd);
    info!(peer = ?stream.peer_addr().ok(), "Received connection from supervisor");
    Ok(stream)
}
