//! Task execution loop for one orchestrator connection.
//!
//! A session runs tasks in order over a single connection:
//!
//! ```text
//! Handshake -> Hydrate -> Execute -> Stream -> Finalize -> Reuse | Terminate
//! ```
//!
//! Broadcast variables survive across the tasks of a session; accumulators
//! are cleared at the start of each task.

use crate::error::{Result, WorkerError};
use crate::protocol::codec::{ABORT_SPLIT_INDEX, ReadExt, SpecialLength, WriteExt};
use crate::protocol::input::InputSequence;
use crate::protocol::serde_mode::{SerializedMode, encode_item};
use crate::worker::function::{FunctionRegistry, TaskCommand, TaskEnv};
use crate::worker::registry::{AccumulatorRegistry, BroadcastRegistry};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Environment variable the orchestrator sets to `1` to reuse workers.
pub const REUSE_WORKER_ENV: &str = "SPARK_REUSE_WORKER";

/// Whether the orchestrator asked for worker reuse.
pub fn reuse_requested() -> bool {
    std::env::var(REUSE_WORKER_ENV).is_ok_and(|v| v == "1")
}

/// Milliseconds since the Unix epoch.
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-task fields received from the orchestrator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskContext {
    pub split_index: i32,
    pub version: String,
    pub work_dir: String,
    /// Include files announced by the orchestrator. Not used by the worker.
    pub includes: Vec<String>,
    pub rdd_id: i32,
    pub stage_id: i32,
    pub partition_id: i32,
    pub input_mode: SerializedMode,
    pub output_mode: SerializedMode,
}

/// How a single task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The orchestrator closed the task with `END_OF_STREAM`; the connection
    /// may carry another task.
    Continue,
    /// The termination handshake did not match; the worker must not be reused.
    Rejected,
    /// The orchestrator sent the abort split index.
    Aborted,
    /// The orchestrator closed a reused connection between tasks.
    Disconnected,
}

/// Why a session stopped serving its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// All tasks completed and the orchestrator closed the connection.
    Clean,
    /// The orchestrator aborted the worker during the handshake.
    Aborted,
    /// The termination handshake failed.
    ProtocolError,
}

impl Termination {
    /// Process exit code for this termination.
    pub fn exit_code(self) -> i32 {
        match self {
            Termination::Clean => 0,
            Termination::Aborted | Termination::ProtocolError => super::EXIT_FAILURE,
        }
    }
}

/// Options for a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Keep serving tasks on the same connection.
    pub reuse: bool,
}

impl SessionConfig {
    /// Configuration from the orchestrator's environment.
    pub fn from_env() -> Self {
        Self {
            reuse: reuse_requested(),
        }
    }
}

/// Task loop state bound to one connection.
pub struct Session<R: Read, W: Write> {
    reader: R,
    writer: W,
    functions: Arc<FunctionRegistry>,
    broadcasts: BroadcastRegistry,
    accumulators: AccumulatorRegistry,
    config: SessionConfig,
    boot_millis: i64,
    tasks_run: usize,
}

impl<R: Read, W: Write> Session<R, W> {
    pub fn new(reader: R, writer: W, functions: Arc<FunctionRegistry>, config: SessionConfig) -> Self {
        Self {
            reader,
            writer,
            functions,
            broadcasts: BroadcastRegistry::new(),
            accumulators: AccumulatorRegistry::new(),
            config,
            boot_millis: now_millis(),
            tasks_run: 0,
        }
    }

    /// Tasks started on this connection. The end-of-session check and an
    /// abort do not count.
    pub fn tasks_run(&self) -> usize {
        self.tasks_run
    }

    /// Tell the orchestrator which process serves this connection.
    pub fn announce_pid(&mut self) -> Result<()> {
        self.writer.write_i32(std::process::id() as i32)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Serve tasks until reuse ends, then wait for the orchestrator to close
    /// the connection.
    ///
    /// Fatal errors are reported to the orchestrator before being returned.
    pub fn serve(&mut self) -> Result<Termination> {
        loop {
            match self.run_task()? {
                TaskOutcome::Continue if self.config.reuse => continue,
                TaskOutcome::Continue => break,
                TaskOutcome::Disconnected => return Ok(Termination::Clean),
                TaskOutcome::Rejected => return Ok(Termination::ProtocolError),
                TaskOutcome::Aborted => return Ok(Termination::Aborted),
            }
        }
        self.wait_for_close();
        Ok(Termination::Clean)
    }

    /// Run one task through all protocol states.
    #[instrument(level = "debug", skip_all, fields(task = self.tasks_run))]
    pub fn run_task(&mut self) -> Result<TaskOutcome> {
        let result = self.execute_task();
        if let Err(e) = &result {
            self.report_failure(e);
        }
        result
    }

    fn execute_task(&mut self) -> Result<TaskOutcome> {
        // Handshake
        let split_index = match self.reader.read_i32() {
            Ok(split_index) => split_index,
            Err(WorkerError::ConnectionClosed) if self.tasks_run > 0 => {
                debug!("Orchestrator closed the connection after the last task");
                return Ok(TaskOutcome::Disconnected);
            }
            Err(e) => return Err(e),
        };
        debug!(split_index, "split_index");
        if split_index == ABORT_SPLIT_INDEX {
            warn!("Orchestrator aborted the worker");
            return Ok(TaskOutcome::Aborted);
        }
        self.tasks_run += 1;
        let mut context = TaskContext {
            split_index,
            version: self.reader.read_required_string("version")?,
            work_dir: self.reader.read_required_string("work directory")?,
            ..Default::default()
        };
        debug!(version = %context.version, work_dir = %context.work_dir, "Handshake");

        // Hydrate
        context.includes = self.read_includes()?;
        self.read_broadcasts()?;
        self.accumulators.clear();

        // Execute and stream
        let payload_len = self.reader.read_i32()?;
        debug!(payload_len, "command length");
        let (init_millis, finish_millis) = match payload_len {
            0 => {
                warn!("Command length is 0, nothing to execute");
                let now = now_millis();
                (now, now)
            }
            len if len > 0 => self.execute_command(&mut context)?,
            len => {
                return Err(WorkerError::protocol(format!(
                    "negative command length: {}",
                    len
                )));
            }
        };

        self.finalize(init_millis, finish_millis)?;
        self.termination_handshake()
    }

    fn read_count(&mut self, what: &str) -> Result<usize> {
        let count = self.reader.read_i32()?;
        usize::try_from(count)
            .map_err(|_| WorkerError::protocol(format!("negative {} count: {}", what, count)))
    }

    fn read_includes(&mut self) -> Result<Vec<String>> {
        let count = self.read_count("include")?;
        debug!(num_includes = count, "Includes");
        (0..count)
            .map(|_| self.reader.read_required_string("include file"))
            .collect()
    }

    fn read_broadcasts(&mut self) -> Result<()> {
        let count = self.read_count("broadcast")?;
        debug!(num_broadcast_variables = count, "Broadcast variables");
        for _ in 0..count {
            let id = self.reader.read_i64()?;
            let path = if id >= 0 {
                Some(self.reader.read_required_string("broadcast path")?)
            } else {
                None
            };
            self.broadcasts.apply(id, path)?;
        }
        debug!(registered = self.broadcasts.len(), "Broadcast registry updated");
        Ok(())
    }

    /// Decode the command, run the task function and stream its output.
    ///
    /// Returns the post-initialisation and completion timestamps.
    fn execute_command(&mut self, context: &mut TaskContext) -> Result<(i64, i64)> {
        let started = Instant::now();
        context.rdd_id = self.reader.read_i32()?;
        context.stage_id = self.reader.read_i32()?;
        context.partition_id = self.reader.read_i32()?;
        info!(
            rdd_id = context.rdd_id,
            stage_id = context.stage_id,
            partition_id = context.partition_id,
            "rddInfo"
        );
        context.input_mode = self.reader.read_required_string("input mode")?.parse()?;
        context.output_mode = self.reader.read_required_string("output mode")?.parse()?;
        debug!(
            input_mode = %context.input_mode,
            output_mode = %context.output_mode,
            "Serialization modes"
        );

        let command_bytes = self
            .reader
            .read_bytes()?
            .ok_or_else(|| WorkerError::protocol("command bytes must not be null"))?;
        let command = TaskCommand::from_bytes(&command_bytes)?;
        let function = self.functions.get(&command.function)?;
        debug!(function = %command.function, bytes = command_bytes.len(), "Command decoded");
        let init_millis = now_millis();

        let (split_index, output_mode) = (context.split_index, context.output_mode);
        let input = InputSequence::new(&mut self.reader, context.input_mode);
        let input_stats = input.stats_handle();
        let env = TaskEnv {
            context: &*context,
            args: &command.args,
            broadcasts: &self.broadcasts,
            accumulators: &mut self.accumulators,
        };

        let func_started = Instant::now();
        let output = function.call(env, split_index, input)?;
        let mut written = 0usize;
        for item in output {
            let item = item?;
            if item.is_null() {
                continue;
            }
            let payload = encode_item(output_mode, &item).inspect_err(|e| {
                error!(item_type = item.type_name(), error = %e, "Exception serializing output");
            })?;
            self.writer.write_bytes(&payload)?;
            written += 1;
        }
        let finish_millis = now_millis();

        let stats = input_stats.get();
        info!(
            function = %command.function,
            input_frames = stats.frames,
            input_items = stats.items,
            input_read_ms = stats.read_time.as_millis(),
            output_items = written,
            func_ms = func_started.elapsed().as_millis(),
            command_ms = started.elapsed().as_millis(),
            "Task processed"
        );
        Ok((init_millis, finish_millis))
    }

    /// Timing block, end-of-data marker and accumulator updates.
    fn finalize(&mut self, init_millis: i64, finish_millis: i64) -> Result<()> {
        debug!(
            boot = self.boot_millis,
            init = init_millis,
            finish = finish_millis,
            "Timing"
        );
        self.writer.write_special(SpecialLength::TimingData)?;
        self.writer.write_i64(self.boot_millis)?;
        self.writer.write_i64(init_millis)?;
        self.writer.write_i64(finish_millis)?;
        // Memory and disk spill are not tracked.
        self.writer.write_i64(0)?;
        self.writer.write_i64(0)?;

        self.writer.write_special(SpecialLength::EndOfDataSection)?;
        self.writer.write_i32(self.accumulators.len() as i32)?;
        for (key, value) in self.accumulators.iter() {
            debug!(key, %value, "Accumulator update");
            let entry = AccumulatorRegistry::encode_entry(*key, value)?;
            self.writer.write_bytes(&entry)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn termination_handshake(&mut self) -> Result<TaskOutcome> {
        let end = self.reader.read_i32()?;
        if end == SpecialLength::EndOfStream.code() {
            self.writer.write_special(SpecialLength::EndOfStream)?;
            self.writer.flush()?;
            debug!("END_OF_STREAM");
            Ok(TaskOutcome::Continue)
        } else {
            // Anything else tells the orchestrator not to reuse this worker.
            warn!(received = end, "Unexpected end of task marker");
            self.writer.write_special(SpecialLength::EndOfDataSection)?;
            self.writer.flush()?;
            Ok(TaskOutcome::Rejected)
        }
    }

    /// Best-effort report of a fatal error to the orchestrator.
    fn report_failure(&mut self, err: &WorkerError) {
        error!(error = %err, "Task failed");
        let written = self
            .writer
            .write_string(&err.to_string())
            .and_then(|()| self.writer.flush().map_err(WorkerError::from));
        match written {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => debug!("Orchestrator closed the socket"),
            Err(e) => warn!(error = %e, "Could not report failure to orchestrator"),
        }
    }

    /// Block until the orchestrator closes the connection, so that it does
    /// not see a reset.
    fn wait_for_close(&mut self) {
        debug!("Waiting for orchestrator to close the connection");
        match io::copy(&mut self.reader, &mut io::sink()) {
            Ok(n) if n > 0 => debug!(bytes = n, "Discarded trailing bytes"),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Connection closed abruptly"),
        }
    }
}
