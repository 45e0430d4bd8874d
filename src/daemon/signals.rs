//! Exit analysis for reaped worker processes.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The task loop ended and the worker exited on its own.
    Clean,
    /// Exited with a non-zero status: a protocol, serialization or task failure.
    Failed(i32),
    /// Killed with SIGKILL, normally on the orchestrator's request.
    Killed,
    /// Killed by some other signal.
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Clean)
    }

    pub fn description(&self) -> String {
        match self {
            Self::Clean => "exited cleanly".to_string(),
            Self::Failed(code) => format!("failed with exit code {}", code),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Classify a `WaitStatus`.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, 0) => TerminationReason::Clean,
        WaitStatus::Exited(_, code) => TerminationReason::Failed(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::Killed,
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
