//! Task functions: the code a task runs against its input.
//!
//! The orchestrator does not ship executable code. Its command bytes name a
//! function registered in the worker's [`FunctionRegistry`] and carry the
//! arguments for it.

use crate::error::{Result, WorkerError};
use crate::protocol::input::InputSequence;
use crate::protocol::serde_mode::Item;
use crate::worker::registry::{AccumulatorRegistry, BroadcastRegistry};
use crate::worker::session::TaskContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Lazy output of a task function.
pub type OutputSequence<'a> = Box<dyn Iterator<Item = Result<Item>> + 'a>;

/// Decoded command bytes of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCommand {
    /// Name of the registered function to run.
    pub function: String,
    /// Function-specific arguments.
    #[serde(default)]
    pub args: serde_json::Value,
}

impl TaskCommand {
    pub fn new(function: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }

    /// Deserialize from command bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Everything a task function may touch besides its input.
pub struct TaskEnv<'a> {
    pub context: &'a TaskContext,
    pub args: &'a serde_json::Value,
    pub broadcasts: &'a BroadcastRegistry,
    pub accumulators: &'a mut AccumulatorRegistry,
}

impl TaskEnv<'_> {
    /// Integer argument by name, if present.
    pub fn arg_i64(&self, name: &str) -> Option<i64> {
        self.args.get(name).and_then(serde_json::Value::as_i64)
    }
}

/// A function a task can run.
///
/// Invocation must not drain the input: the returned sequence is pulled item
/// by item while results are streamed back.
pub trait TaskFunction: Send + Sync {
    fn call<'a>(
        &self,
        env: TaskEnv<'a>,
        split_index: i32,
        input: InputSequence<'a>,
    ) -> Result<OutputSequence<'a>>;
}

/// Functions known to this worker, by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn TaskFunction>>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("identity", Identity);
        registry.register("count", Count);
        registry.register("upper", Upper);
        registry.register("broadcast_lookup", BroadcastLookup);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, function: impl TaskFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TaskFunction>> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownFunction(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// Passes every input item through unchanged.
pub struct Identity;

impl TaskFunction for Identity {
    fn call<'a>(
        &self,
        _env: TaskEnv<'a>,
        _split_index: i32,
        input: InputSequence<'a>,
    ) -> Result<OutputSequence<'a>> {
        Ok(Box::new(input))
    }
}

/// Emits the number of input items. With `{"accumulator": key}` the count is
/// also added to that accumulator.
pub struct Count;

impl TaskFunction for Count {
    fn call<'a>(
        &self,
        env: TaskEnv<'a>,
        _split_index: i32,
        input: InputSequence<'a>,
    ) -> Result<OutputSequence<'a>> {
        let key = env
            .arg_i64("accumulator")
            .map(|k| {
                i32::try_from(k).map_err(|_| {
                    WorkerError::task(format!("accumulator key {} is out of range", k))
                })
            })
            .transpose()?;
        let partition_id = env.context.partition_id;
        let accumulators = env.accumulators;
        Ok(Box::new(std::iter::once_with(move || {
            let mut count: i64 = 0;
            for item in input {
                item?;
                count += 1;
            }
            debug!(partition_id, count, "Counted partition");
            if let Some(key) = key {
                accumulators.add(key, count)?;
            }
            Ok(Item::Object(serde_json::Value::from(count)))
        })))
    }
}

/// Upper-cases text items. Nulls pass through.
pub struct Upper;

impl TaskFunction for Upper {
    fn call<'a>(
        &self,
        _env: TaskEnv<'a>,
        _split_index: i32,
        input: InputSequence<'a>,
    ) -> Result<OutputSequence<'a>> {
        Ok(Box::new(input.map(|item| match item? {
            Item::Text(text) => Ok(Item::Text(text.to_uppercase())),
            Item::Null => Ok(Item::Null),
            other => Err(WorkerError::task(format!(
                "upper expects text, got {}",
                other.type_name()
            ))),
        })))
    }
}

/// Looks each text item up as a key of the object held by broadcast
/// `{"broadcast": id}`. Missing keys produce nulls, which are not written.
pub struct BroadcastLookup;

impl TaskFunction for BroadcastLookup {
    fn call<'a>(
        &self,
        env: TaskEnv<'a>,
        _split_index: i32,
        input: InputSequence<'a>,
    ) -> Result<OutputSequence<'a>> {
        let id = env
            .arg_i64("broadcast")
            .ok_or_else(|| WorkerError::task("broadcast_lookup needs a 'broadcast' argument"))?;
        let broadcast = env
            .broadcasts
            .get(id)
            .ok_or_else(|| WorkerError::task(format!("broadcast {} is not registered", id)))?;

        Ok(Box::new(input.map(move |item| {
            let item = item?;
            let Some(key) = item.as_text() else {
                return Ok(Item::Null);
            };
            let table = broadcast.value()?;
            Ok(table
                .get(key)
                .cloned()
                .map(Item::Object)
                .unwrap_or(Item::Null))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{SpecialLength, WriteExt};
    use crate::protocol::serde_mode::SerializedMode;
    use serde_json::json;
    use std::io::{Cursor, Write};

    fn text_input(values: &[&str]) -> Cursor<Vec<u8>> {
        let mut wire = Vec::new();
        for v in values {
            wire.write_string(v).unwrap();
        }
        wire.write_special(SpecialLength::EndOfDataSection).unwrap();
        Cursor::new(wire)
    }

    fn run(
        registry: &FunctionRegistry,
        command: &TaskCommand,
        broadcasts: &BroadcastRegistry,
        accumulators: &mut AccumulatorRegistry,
        reader: &mut Cursor<Vec<u8>>,
    ) -> Result<Vec<Item>> {
        let context = TaskContext::default();
        let function = registry.get(&command.function)?;
        let env = TaskEnv {
            context: &context,
            args: &command.args,
            broadcasts,
            accumulators,
        };
        let input = InputSequence::new(reader, SerializedMode::String);
        function.call(env, 0, input)?.collect()
    }

    #[test]
    fn test_command_bytes_roundtrip() {
        let command = TaskCommand::new("count", json!({"accumulator": 1}));
        let parsed = TaskCommand::from_bytes(&serde_json::to_vec(&command).unwrap()).unwrap();
        assert_eq!(parsed, command);

        let bare = TaskCommand::from_bytes(br#"{"function":"identity"}"#).unwrap();
        assert_eq!(bare.args, serde_json::Value::Null);
    }

    #[test]
    fn test_unknown_function() {
        let registry = FunctionRegistry::with_builtins();
        assert!(matches!(
            registry.get("explode"),
            Err(WorkerError::UnknownFunction(_))
        ));
        assert_eq!(
            registry.names(),
            vec!["broadcast_lookup", "count", "identity", "upper"]
        );
    }

    #[test]
    fn test_count_updates_accumulator() {
        let registry = FunctionRegistry::with_builtins();
        let mut accumulators = AccumulatorRegistry::new();
        let mut reader = text_input(&["a", "b", "c"]);
        let command = TaskCommand::new("count", json!({"accumulator": 4}));

        let out = run(
            &registry,
            &command,
            &BroadcastRegistry::new(),
            &mut accumulators,
            &mut reader,
        )
        .unwrap();
        assert_eq!(out, vec![Item::Object(json!(3))]);
        assert_eq!(accumulators.get(4), Some(&json!(3)));
    }

    #[test]
    fn test_count_rejects_out_of_range_accumulator_key() {
        let registry = FunctionRegistry::with_builtins();
        let mut accumulators = AccumulatorRegistry::new();
        let mut reader = text_input(&["a"]);
        let command = TaskCommand::new("count", json!({"accumulator": 4_294_967_297i64}));

        let result = run(
            &registry,
            &command,
            &BroadcastRegistry::new(),
            &mut accumulators,
            &mut reader,
        );
        assert!(matches!(result, Err(WorkerError::Task(_))));
        assert_eq!(accumulators.len(), 0);
    }

    #[test]
    fn test_upper() {
        let registry = FunctionRegistry::with_builtins();
        let mut reader = text_input(&["spark", "rust"]);
        let out = run(
            &registry,
            &TaskCommand::new("upper", serde_json::Value::Null),
            &BroadcastRegistry::new(),
            &mut AccumulatorRegistry::new(),
            &mut reader,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![Item::Text("SPARK".into()), Item::Text("RUST".into())]
        );
    }

    #[test]
    fn test_broadcast_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"a": 1, "b": 2}}"#).unwrap();
        let mut broadcasts = BroadcastRegistry::new();
        broadcasts.insert(5, file.path());

        let registry = FunctionRegistry::with_builtins();
        let mut reader = text_input(&["b", "zz", "a"]);
        let out = run(
            &registry,
            &TaskCommand::new("broadcast_lookup", json!({"broadcast": 5})),
            &broadcasts,
            &mut AccumulatorRegistry::new(),
            &mut reader,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                Item::Object(json!(2)),
                Item::Null,
                Item::Object(json!(1))
            ]
        );
    }

    #[test]
    fn test_broadcast_lookup_unregistered() {
        let registry = FunctionRegistry::with_builtins();
        let mut reader = text_input(&[]);
        let result = run(
            &registry,
            &TaskCommand::new("broadcast_lookup", json!({"broadcast": 8})),
            &BroadcastRegistry::new(),
            &mut AccumulatorRegistry::new(),
            &mut reader,
        );
        assert!(matches!(result, Err(WorkerError::Task(_))));
    }
}
