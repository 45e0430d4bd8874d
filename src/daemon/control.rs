//! Control channel from the orchestrator.
//!
//! The supervisor's stdin carries one big-endian `i32` worker pid per kill
//! request. A dedicated thread blocks on those reads and forwards each
//! command over a channel, so the supervisor loop only ever polls it.
//!
//! The reader thread never logs: the supervisor forks while it runs, and a
//! child forked while this thread held the log writer's lock would block on
//! its first log line. Everything worth reporting goes through the channel.

use crate::error::{Result, WorkerError};
use crate::protocol::codec::ReadExt;
use std::io::Read;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

/// A request received on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Kill the worker with this process id.
    Kill(i32),
    /// Reading the channel failed; no further commands follow.
    ReadFailed(String),
}

/// Start reading commands from `input` on a background thread.
///
/// The returned receiver disconnects once `input` reaches EOF or fails,
/// which the supervisor treats as a shutdown request.
pub fn spawn_control_reader<R>(input: R) -> Result<(Receiver<ControlCommand>, JoinHandle<()>)>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("control-reader".to_string())
        .spawn(move || read_commands(input, tx))
        .map_err(|e| WorkerError::Supervisor(format!("failed to start control reader: {}", e)))?;
    Ok((rx, handle))
}

fn read_commands<R: Read>(mut input: R, tx: Sender<ControlCommand>) {
    loop {
        match input.read_i32() {
            Ok(pid) => {
                if tx.send(ControlCommand::Kill(pid)).is_err() {
                    // Supervisor is gone.
                    return;
                }
            }
            Err(WorkerError::ConnectionClosed) => return,
            Err(e) => {
                let _ = tx.send(ControlCommand::ReadFailed(e.to_string()));
                return;
            }
        }
    }
}
