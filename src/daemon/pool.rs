//! Supervisor loop and the table of live workers.

use super::control::ControlCommand;
use super::proc::WorkerProc;
use super::signals::TerminationReason;
use super::spawn::{HandoffConfig, SpawnStrategy, transfer_connection};
use crate::error::{Result, WorkerError};
use crate::protocol::codec::WriteExt;
use crate::worker::function::FunctionRegistry;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on how long one listener poll blocks.
    pub poll_interval: Duration,
    pub handoff: HandoffConfig,
}

impl SupervisorConfig {
    pub fn new(strategy: SpawnStrategy) -> Result<Self> {
        Ok(Self {
            poll_interval: Duration::from_millis(100),
            handoff: HandoffConfig::new(strategy)?,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff = self.handoff.with_timeout(timeout);
        self
    }
}

/// A live worker tracked by the supervisor.
#[derive(Debug)]
pub struct WorkerEntry {
    pub proc: WorkerProc,
    pub peer: Option<SocketAddr>,
    pub started: Instant,
    pub strategy: SpawnStrategy,
}

/// Live workers by process id.
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: BTreeMap<i32, WorkerEntry>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: WorkerEntry) {
        self.workers.insert(entry.proc.pid().as_raw(), entry);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn pids(&self) -> Vec<i32> {
        self.workers.keys().copied().collect()
    }

    /// Kill a tracked worker and wait for it to exit.
    ///
    /// Untracked pids are ignored, as are failures to signal a worker that
    /// has already gone. Returns whether a tracked worker was removed.
    pub fn kill(&mut self, pid: i32) -> bool {
        let Some(mut entry) = self.workers.remove(&pid) else {
            debug!(pid, "Ignoring kill request for untracked pid");
            return false;
        };
        match entry.proc.kill() {
            Ok(reason) => info!(
                pid,
                %reason,
                peer = ?entry.peer,
                strategy = %entry.strategy,
                uptime_ms = entry.started.elapsed().as_millis(),
                "Worker killed"
            ),
            Err(e) => debug!(pid, error = %e, "Kill failed, worker already gone"),
        }
        true
    }

    /// Kill every tracked worker.
    pub fn kill_all(&mut self) {
        if self.is_empty() {
            return;
        }
        debug!(count = self.len(), "Killing all workers");
        for pid in self.pids() {
            self.kill(pid);
        }
    }

    /// Collect workers that have exited on their own.
    pub fn reap(&mut self) -> Vec<(i32, TerminationReason)> {
        let mut finished = Vec::new();
        for (pid, entry) in self.workers.iter_mut() {
            match entry.proc.try_wait() {
                Ok(None) => {}
                Ok(Some(reason)) => finished.push((*pid, reason)),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to poll worker");
                    finished.push((*pid, TerminationReason::Unknown));
                }
            }
        }
        for (pid, reason) in &finished {
            if let Some(entry) = self.workers.remove(pid) {
                let uptime_ms = entry.started.elapsed().as_millis();
                if reason.is_success() {
                    debug!(pid, uptime_ms, "Worker exited");
                } else {
                    info!(
                        pid,
                        uptime_ms,
                        %reason,
                        peer = ?entry.peer,
                        strategy = %entry.strategy,
                        "Worker exited"
                    );
                }
            }
        }
        finished
    }
}

/// Accepts orchestrator connections and hands each one to a worker process.
pub struct Supervisor {
    listener: TcpListener,
    workers: WorkerTable,
    functions: Arc<FunctionRegistry>,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Bind the loopback listener on an ephemeral port.
    pub fn bind(config: SupervisorConfig, functions: Arc<FunctionRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .map_err(|e| WorkerError::Supervisor(format!("failed to bind listener: {}", e)))?;
        Ok(Self {
            listener,
            workers: WorkerTable::new(),
            functions,
            config,
        })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Write the listening port as one big-endian `i32`.
    pub fn report_port(&self, out: &mut impl Write) -> Result<()> {
        out.write_i32(i32::from(self.port()?))?;
        out.flush()?;
        Ok(())
    }

    /// Run until the control channel closes.
    ///
    /// Listener failures end the loop with an error.
    #[instrument(level = "debug", skip_all, fields(port = self.port().unwrap_or_default()))]
    pub fn run(&mut self, commands: &Receiver<ControlCommand>) -> Result<()> {
        info!(
            port = self.port()?,
            strategy = %self.config.handoff.strategy,
            "Supervisor listening"
        );
        loop {
            if !self.drain_commands(commands) {
                info!(workers = self.workers.len(), "Control channel closed, shutting down");
                self.workers.kill_all();
                return Ok(());
            }
            self.workers.reap();
            if self.poll_listener()? {
                self.accept()?;
            }
        }
    }

    /// Apply pending control commands. Returns `false` once the channel is
    /// closed.
    fn drain_commands(&mut self, commands: &Receiver<ControlCommand>) -> bool {
        loop {
            match commands.try_recv() {
                Ok(ControlCommand::Kill(pid)) => {
                    debug!(pid, "Kill request");
                    self.workers.kill(pid);
                }
                Ok(ControlCommand::ReadFailed(message)) => {
                    warn!(error = %message, "Control channel read failed");
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn poll_listener(&self) -> Result<bool> {
        let millis = u16::try_from(self.config.poll_interval.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    return Err(WorkerError::Supervisor(format!(
                        "listener poll reported {:?}",
                        revents
                    )));
                }
                Ok(revents.contains(PollFlags::POLLIN))
            }
            Err(e) => Err(WorkerError::Supervisor(format!("listener poll failed: {}", e))),
        }
    }

    fn accept(&mut self) -> Result<()> {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                debug!(error = %e, "Transient accept failure");
                return Ok(());
            }
            Err(e) => {
                return Err(WorkerError::Supervisor(format!("accept failed: {}", e)));
            }
        };
        debug!(%peer, "Accepted connection");

        match transfer_connection(
            stream,
            &self.listener,
            &self.functions,
            &self.config.handoff,
        ) {
            Ok(proc) => {
                info!(pid = %proc.pid(), %peer, "Worker started");
                self.workers.insert(WorkerEntry {
                    proc,
                    peer: Some(peer),
                    started: Instant::now(),
                    strategy: self.config.handoff.strategy,
                });
            }
            // The orchestrator sees the connection close and handles it.
            Err(e) => error!(%peer, error = %e, "Failed to hand connection to a worker"),
        }
        Ok(())
    }
}
