//! Agent checkpoints: identifiers, blob codec, and the per-agent coordinator
//!
//! A checkpoint is written after every completed suspend point and captures
//! the local namespace, the agent's execution state, and enough of the
//! in-flight oracle turn to resume it without repeating executed statements.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use super::Codec;
use super::error::{CheckpointError, CheckpointResult};
use super::state::{CallStackFrame, ExecutionState};
use super::storage::CheckpointStore;
use crate::interpreter::Namespace;

const ID_SEPARATOR: &str = "_ckpt_";

/// `{execution_id}_ckpt_{counter}`; ordered by execution id, then numerically
/// by counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointId {
    execution_id: String,
    counter: u64,
}

impl CheckpointId {
    /// Create an id
    pub fn new(execution_id: impl Into<String>, counter: u64) -> Self {
        Self {
            execution_id: execution_id.into(),
            counter,
        }
    }

    /// Execution (agent or program) this checkpoint belongs to
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Monotonic counter
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.execution_id, ID_SEPARATOR, self.counter)
    }
}

impl FromStr for CheckpointId {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (execution_id, counter) = s
            .rsplit_once(ID_SEPARATOR)
            .ok_or_else(|| CheckpointError::InvalidId(s.to_string()))?;
        if execution_id.is_empty() {
            return Err(CheckpointError::InvalidId(s.to_string()));
        }
        let counter = counter
            .parse::<u64>()
            .map_err(|_| CheckpointError::InvalidId(s.to_string()))?;
        Ok(Self::new(execution_id, counter))
    }
}

impl Serialize for CheckpointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CheckpointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Progress of the oracle turn that was running when a checkpoint was taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnProgress {
    /// Oracle output received so far
    pub oracle_output: String,
    /// Prefix of the output already executed
    pub executed_prefix: String,
    /// Awaits completed by the checkpointed statement
    pub nested_suspends: usize,
}

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Statement that triggered the checkpoint
    pub statement: String,
    /// Full oracle output of the in-flight turn (absent between turns)
    pub oracle_output: Option<String>,
    /// Executed prefix of `oracle_output`
    pub executed_prefix: Option<String>,
    /// Per-execution counter
    pub counter: u64,
    /// When the checkpoint was written
    pub timestamp: DateTime<Utc>,
    /// Call stack at the suspend point, bottom first
    pub call_stack: Vec<CallStackFrame>,
    /// Awaits completed inside the checkpointed statement
    #[serde(default)]
    pub nested_suspends: usize,
}

impl CheckpointMetadata {
    /// In-flight turn recorded by this checkpoint, if any
    pub fn turn(&self) -> Option<TurnProgress> {
        Some(TurnProgress {
            oracle_output: self.oracle_output.clone()?,
            executed_prefix: self.executed_prefix.clone()?,
            nested_suspends: self.nested_suspends,
        })
    }
}

/// Immutable record of one agent at a suspend point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Local namespace of the in-flight turn
    pub namespace: Namespace,
    /// Agent execution state
    pub execution_state: ExecutionState,
    /// Metadata
    pub metadata: CheckpointMetadata,
}

/// Serialize a value with the given codec
pub fn encode_blob<T: Serialize>(value: &T, codec: Codec) -> CheckpointResult<Vec<u8>> {
    match codec {
        Codec::Json => {
            serde_json::to_vec_pretty(value).map_err(|e| CheckpointError::Encode(e.to_string()))
        }
        Codec::Preserves => {
            use preserves::PackedWriter;
            let mut buf = Vec::new();
            let mut writer = PackedWriter::new(&mut buf);
            preserves::serde::to_writer(&mut writer, value)
                .map_err(|e| CheckpointError::Encode(e.to_string()))?;
            Ok(buf)
        }
    }
}

/// Deserialize a blob written by either codec
pub fn decode_blob<T: DeserializeOwned>(data: &[u8]) -> CheckpointResult<T> {
    let first = data.iter().find(|byte| !byte.is_ascii_whitespace());
    match first {
        Some(b'{') | Some(b'[') => {
            serde_json::from_slice(data).map_err(|e| CheckpointError::Decode(e.to_string()))
        }
        Some(_) => {
            preserves::serde::from_bytes(data).map_err(|e| CheckpointError::Decode(e.to_string()))
        }
        None => Err(CheckpointError::Decode("empty blob".to_string())),
    }
}

/// Notified after an agent checkpoint has been written
pub trait CheckpointListener: Send + Sync {
    /// `agent_id` persisted checkpoint `id`
    fn agent_checkpointed(&self, agent_id: &str, id: &CheckpointId);
}

/// Checkpoint bookkeeping for a single agent
pub struct AgentCheckpointCoordinator {
    execution_id: String,
    store: Arc<dyn CheckpointStore>,
    codec: Codec,
    keep_last: usize,
    counter: Mutex<u64>,
    listener: Option<Weak<dyn CheckpointListener>>,
}

impl AgentCheckpointCoordinator {
    /// Create a coordinator. The counter starts after the newest checkpoint
    /// already in the store, so existing history is never overwritten.
    pub fn new(
        execution_id: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        codec: Codec,
    ) -> CheckpointResult<Self> {
        let execution_id = execution_id.into();
        let counter = store
            .latest(&execution_id)?
            .map(|id| id.counter())
            .unwrap_or(0);
        Ok(Self {
            execution_id,
            store,
            codec,
            keep_last: 0,
            counter: Mutex::new(counter),
            listener: None,
        })
    }

    /// Keep only the newest `keep_last` checkpoints (0 keeps all)
    pub fn with_retention(mut self, keep_last: usize) -> Self {
        self.keep_last = keep_last;
        self
    }

    /// Report every save to `listener`
    pub fn with_listener(mut self, listener: Weak<dyn CheckpointListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Execution id (the agent id)
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Counter of the last checkpoint written or restored
    pub fn counter(&self) -> u64 {
        *self.counter.lock()
    }

    /// Continue numbering after a restored checkpoint
    pub fn restore_counter(&self, counter: u64) {
        let mut current = self.counter.lock();
        *current = (*current).max(counter);
    }

    /// Snapshot the agent and persist it
    pub fn save(
        &self,
        statement: &str,
        namespace: &Namespace,
        state: &ExecutionState,
        turn: Option<TurnProgress>,
    ) -> CheckpointResult<CheckpointId> {
        let counter = {
            let mut counter = self.counter.lock();
            *counter += 1;
            *counter
        };
        let id = CheckpointId::new(self.execution_id.clone(), counter);

        let (oracle_output, executed_prefix, nested_suspends) = match turn {
            Some(turn) => (
                Some(turn.oracle_output),
                Some(turn.executed_prefix),
                turn.nested_suspends,
            ),
            None => (None, None, 0),
        };
        let checkpoint = Checkpoint {
            namespace: namespace.clone(),
            execution_state: state.clone(),
            metadata: CheckpointMetadata {
                statement: statement.to_string(),
                oracle_output,
                executed_prefix,
                counter,
                timestamp: Utc::now(),
                call_stack: state.call_stack.frames().to_vec(),
                nested_suspends,
            },
        };

        let blob = encode_blob(&checkpoint, self.codec)?;
        self.store.put(&id, &blob)?;
        tracing::debug!(checkpoint = %id, stack = %state.call_stack, statement, "checkpoint saved");

        if self.keep_last > 0 {
            let removed = self.store.prune(&self.execution_id, self.keep_last)?;
            if removed > 0 {
                tracing::debug!(execution = %self.execution_id, removed, "pruned checkpoints");
            }
        }

        if let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade) {
            listener.agent_checkpointed(&self.execution_id, &id);
        }
        Ok(id)
    }

    /// Load a specific checkpoint
    pub fn load(&self, id: &CheckpointId) -> CheckpointResult<Option<Checkpoint>> {
        load_checkpoint(self.store.as_ref(), id)
    }

    /// Id of the newest checkpoint, by numeric counter
    pub fn latest_id(&self) -> CheckpointResult<Option<CheckpointId>> {
        Ok(self.store.latest(&self.execution_id)?)
    }

    /// Newest checkpoint, by numeric counter
    pub fn latest(&self) -> CheckpointResult<Option<Checkpoint>> {
        match self.latest_id()? {
            Some(id) => self.load(&id),
            None => Ok(None),
        }
    }

    /// All checkpoint ids, oldest first
    pub fn list(&self) -> CheckpointResult<Vec<CheckpointId>> {
        Ok(self.store.list(&self.execution_id)?)
    }

    /// Delete all but the newest `keep_last` checkpoints
    pub fn prune(&self, keep_last: usize) -> CheckpointResult<usize> {
        Ok(self.store.prune(&self.execution_id, keep_last)?)
    }
}

/// Read and decode a checkpoint from any store
pub fn load_checkpoint(
    store: &dyn CheckpointStore,
    id: &CheckpointId,
) -> CheckpointResult<Option<Checkpoint>> {
    match store.get(id)? {
        Some(blob) => decode_blob(&blob).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Value;
    use crate::runtime::state::InstructionPointer;
    use crate::runtime::storage::MemoryCheckpointStore;

    fn coordinator(store: Arc<dyn CheckpointStore>) -> AgentCheckpointCoordinator {
        AgentCheckpointCoordinator::new("1000", store, Codec::Json).unwrap()
    }

    #[test]
    fn ids_parse_and_order_numerically() {
        let id: CheckpointId = "abc_program_ckpt_10".parse().unwrap();
        assert_eq!(id.execution_id(), "abc_program");
        assert_eq!(id.counter(), 10);
        assert!(CheckpointId::new("1000", 2) < CheckpointId::new("1000", 10));
        assert!("1000_ckpt_x".parse::<CheckpointId>().is_err());
        assert!("_ckpt_3".parse::<CheckpointId>().is_err());
    }

    #[test]
    fn latest_uses_numeric_counter() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let coord = coordinator(store.clone());
        let state = ExecutionState::new();
        for _ in 0..10 {
            coord.save("await Step('Main:01')", &Namespace::new(), &state, None).unwrap();
        }
        assert_eq!(coord.latest_id().unwrap().unwrap().to_string(), "1000_ckpt_10");
        assert_eq!(coord.latest().unwrap().unwrap().metadata.counter, 10);
    }

    #[test]
    fn new_coordinator_continues_existing_history() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let state = ExecutionState::new();
        let first = coordinator(store.clone());
        first.save("a", &Namespace::new(), &state, None).unwrap();
        first.save("b", &Namespace::new(), &state, None).unwrap();

        let second = coordinator(store);
        assert_eq!(second.counter(), 2);
        let id = second.save("c", &Namespace::new(), &state, None).unwrap();
        assert_eq!(id.counter(), 3);
    }

    #[test]
    fn metadata_carries_turn_and_stack() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let coord = coordinator(store).with_retention(2);
        let mut state = ExecutionState::new();
        state.call_stack.push(CallStackFrame::new(InstructionPointer::new("Main", "01", 4)));
        let mut ns = Namespace::new();
        ns.set("x", Value::Int(10));

        for _ in 0..3 {
            coord
                .save(
                    "await Say('hi')",
                    &ns,
                    &state,
                    Some(TurnProgress {
                        oracle_output: "x = 10\nawait Say('hi')\n".into(),
                        executed_prefix: "x = 10\nawait Say('hi')\n".into(),
                        nested_suspends: 1,
                    }),
                )
                .unwrap();
        }

        assert_eq!(coord.list().unwrap().len(), 2);
        let latest = coord.latest().unwrap().unwrap();
        assert_eq!(latest.namespace, ns);
        assert_eq!(latest.metadata.call_stack, state.call_stack.frames().to_vec());
        let turn = latest.metadata.turn().unwrap();
        assert_eq!(turn.executed_prefix, "x = 10\nawait Say('hi')\n");
        assert_eq!(turn.nested_suspends, 1);
    }

    fn every_kind_of_value() -> Namespace {
        let mut ns = Namespace::new();
        ns.set("nothing", Value::None);
        ns.set("flag", Value::Bool(true));
        ns.set("count", Value::Int(i64::MIN));
        ns.set("mean", Value::Float(7.6328571428571435));
        ns.set("tiny", Value::Float(1.0715660391465826e-75));
        ns.set("up", Value::Float(f64::INFINITY));
        ns.set("down", Value::Float(f64::NEG_INFINITY));
        ns.set("name", Value::Str("tea \"green\"\n".into()));
        ns.set("peer", Value::AgentRef("1001".into()));
        let mut dict = std::collections::BTreeMap::new();
        dict.insert("empty".to_string(), Value::List(Vec::new()));
        dict.insert("mixed".to_string(), Value::List(vec![Value::None, Value::Int(-1)]));
        ns.set("dict", Value::Dict(dict));
        ns.set(
            "series",
            Value::List((1..200).map(|k| Value::Float(k as f64 / 7.0 * 1.37)).collect()),
        );
        ns
    }

    #[test]
    fn values_are_exact_under_both_codecs() {
        let ns = every_kind_of_value();
        for codec in [Codec::Json, Codec::Preserves] {
            let blob = encode_blob(&ns, codec).unwrap();
            let back: Namespace = decode_blob(&blob).unwrap();
            assert_eq!(back, ns, "{:?}", codec);
        }
    }

    #[test]
    fn nan_survives_both_codecs() {
        let mut ns = Namespace::new();
        ns.set("odd", Value::Float(f64::NAN));
        for codec in [Codec::Json, Codec::Preserves] {
            let back: Namespace = decode_blob(&encode_blob(&ns, codec).unwrap()).unwrap();
            assert!(matches!(back.get("odd"), Some(Value::Float(num)) if num.is_nan()));
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_blob::<Checkpoint>(b"").is_err());
        assert!(decode_blob::<Checkpoint>(b"{\"namespace\": 3}").is_err());
    }
}
