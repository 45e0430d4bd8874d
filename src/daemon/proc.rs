//! Process handle for supervised workers.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{Result, WorkerError};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

/// Handle to a worker process that is a child of the supervisor.
#[derive(Debug)]
pub struct WorkerProc {
    pid: Pid,
    /// Whether the process has been reaped
    reaped: bool,
}

impl WorkerProc {
    pub fn new(pid: Pid) -> Self {
        Self { pid, reaped: false }
    }

    /// Adopt a child started with `std::process::Command`.
    ///
    /// The child is reaped through `waitpid` from here on, not through the
    /// `Child` value.
    pub fn from_child(child: &std::process::Child) -> Self {
        Self::new(Pid::from_raw(child.id() as i32))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Err(WorkerError::Supervisor(format!(
                "worker {} already reaped",
                self.pid
            )));
        }
        let status = loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                other => break other?,
            }
        };
        self.reaped = true;
        Ok(analyze_wait_status(status))
    }

    /// Reap the process if it has exited (non-blocking).
    ///
    /// Returns `None` while it is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.reaped {
            return Err(WorkerError::Supervisor(format!(
                "worker {} already reaped",
                self.pid
            )));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(analyze_wait_status(status)))
            }
            Err(Errno::ECHILD) => {
                // Reaped elsewhere; nothing left to wait for.
                self.reaped = true;
                Ok(Some(TerminationReason::Unknown))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send SIGKILL and wait for the process to exit.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            // Already exited but not yet reaped: waitpid still collects it.
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        match self.wait() {
            Err(WorkerError::Nix(Errno::ECHILD)) => {
                self.reaped = true;
                Ok(TerminationReason::Unknown)
            }
            other => other,
        }
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}
