//! Error types for sparkworker.

use thiserror::Error;

/// Main error type for the worker and the supervisor.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Cannot serialize {type_name} output item: {message}")]
    Serialization { type_name: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pickle error: {0}")]
    Pickle(#[from] serde_pickle::Error),

    #[error("Invalid UTF-8 string: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Unknown task function '{0}'")]
    UnknownFunction(String),

    #[error("Task function failed: {0}")]
    Task(String),

    #[error("Broadcast variable {id} could not be loaded from {path}: {message}")]
    Broadcast {
        id: i64,
        path: String,
        message: String,
    },

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Socket hand-off failed: {0}")]
    Handoff(String),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::errno::Errno),
}

impl WorkerError {
    /// Build a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Build a task failure error from a user function.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task(message.into())
    }

    /// Whether the peer is gone and nothing more can be written to it.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type alias for sparkworker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
