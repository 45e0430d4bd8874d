//! Task execution side of the worker protocol.
//!
//! A worker process owns one orchestrator connection and runs tasks on it,
//! one after the other:
//!
//! ```text
//!   orchestrator ──TCP──► Session ──► FunctionRegistry::get(name)
//!        ▲                   │                 │
//!        │                   ▼                 ▼
//!        └───── frames ── Stream ◄── TaskFunction(input)
//! ```
//!
//! The worker is reached in one of three ways: started directly by the
//! orchestrator (`-port` or `-m pyspark.worker`), forked by the supervisor,
//! or spawned by the supervisor and handed the connection's descriptor.
//! The task loop is the same in every case.

pub mod function;
pub mod registry;
pub mod session;
pub mod worker_main;

/// Exit status for every fatal worker condition.
pub const EXIT_FAILURE: i32 = 255;
