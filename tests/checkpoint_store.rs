//! Integration tests for durable checkpoint storage
//!
//! Exercises the filesystem store, checkpoint numbering across coordinator
//! instances, and the session registry, all against real directories.

use encore::interpreter::{Namespace, Value};
use encore::runtime::checkpoint::TurnProgress;
use encore::runtime::storage::{CheckpointStore, FilesystemCheckpointStore};
use encore::runtime::{
    AgentCheckpointCoordinator, CallStackFrame, CheckpointId, Codec, ExecutionState,
    InstructionPointer, SessionRegistry,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn state_at(step: &str) -> ExecutionState {
    let mut state = ExecutionState::new();
    state
        .call_stack
        .push(CallStackFrame::new(InstructionPointer::new("Main", step, 3)));
    state
}

#[test]
fn test_counter_continues_after_restart() {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> =
        Arc::new(FilesystemCheckpointStore::new(temp.path(), 1024 * 1024));

    let first = AgentCheckpointCoordinator::new("1000", store.clone(), Codec::Json).unwrap();
    let mut last = None;
    for _ in 0..16 {
        last = Some(first.save("await Say('hi')", &Namespace::new(), &state_at("01"), None).unwrap());
    }
    assert_eq!(last.unwrap().to_string(), "1000_ckpt_16");

    // A new process opens the same store and keeps counting
    let second = AgentCheckpointCoordinator::new("1000", store.clone(), Codec::Json).unwrap();
    let next = second
        .save("await Say('again')", &Namespace::new(), &state_at("02"), None)
        .unwrap();
    assert_eq!(next.to_string(), "1000_ckpt_17");

    let latest = second.latest().unwrap().unwrap();
    assert_eq!(latest.metadata.counter, 17);
    assert_eq!(latest.metadata.call_stack[0].instruction_pointer.line, "02");
}

#[test]
fn test_latest_is_numeric_not_lexicographic() {
    let temp = TempDir::new().unwrap();
    let store = FilesystemCheckpointStore::new(temp.path(), 1024);
    for counter in [2, 9, 10, 1] {
        store.put(&CheckpointId::new("1000", counter), b"{}").unwrap();
    }

    let listed: Vec<u64> = store.list("1000").unwrap().iter().map(CheckpointId::counter).collect();
    assert_eq!(listed, vec![1, 2, 9, 10]);
    assert_eq!(store.latest("1000").unwrap().unwrap().counter(), 10);

    assert_eq!(store.prune("1000", 2).unwrap(), 2);
    let kept: Vec<u64> = store.list("1000").unwrap().iter().map(CheckpointId::counter).collect();
    assert_eq!(kept, vec![9, 10]);
}

#[test]
fn test_in_flight_turn_survives_both_codecs() {
    for codec in [Codec::Json, Codec::Preserves] {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn CheckpointStore> =
            Arc::new(FilesystemCheckpointStore::new(temp.path(), 1024 * 1024));
        let coordinator = AgentCheckpointCoordinator::new("1001", store, codec).unwrap();

        let mut namespace = Namespace::new();
        namespace.set("x", Value::Int(10));
        let mut quote = BTreeMap::new();
        quote.insert("price".to_string(), Value::Float(12.5));
        quote.insert("items".to_string(), Value::List(vec![Value::Str("tea".into()), Value::None]));
        namespace.set("quote", Value::Dict(quote));

        let mut state = state_at("02");
        state.set_variable("budget", Value::Int(100));

        let turn = TurnProgress {
            oracle_output: "x = 10\nawait Say('hi')\ny = 20\n".to_string(),
            executed_prefix: "x = 10\nawait Say('hi')\n".to_string(),
            nested_suspends: 1,
        };
        coordinator
            .save("await Say('hi')", &namespace, &state, Some(turn.clone()))
            .unwrap();

        let loaded = coordinator.latest().unwrap().unwrap();
        assert_eq!(loaded.namespace, namespace);
        assert_eq!(loaded.execution_state.get_variable("budget"), Some(&Value::Int(100)));
        assert_eq!(loaded.metadata.turn(), Some(turn));
    }
}

#[test]
fn test_oversized_checkpoint_is_rejected() {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FilesystemCheckpointStore::new(temp.path(), 64));
    let coordinator = AgentCheckpointCoordinator::new("1000", store.clone(), Codec::Json).unwrap();

    let result = coordinator.save("await Say('hi')", &Namespace::new(), &state_at("01"), None);
    assert!(result.is_err());
    assert!(store.list("1000").unwrap().is_empty());
}

#[test]
fn test_session_registry_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("checkpoints");

    let sessions = SessionRegistry::open(&dir).unwrap();
    sessions.record("0123456789abcdef", "session-a").unwrap();
    sessions.record("0123456789abcdef", "session-b").unwrap();
    sessions.record("fedcba9876543210", "session-c").unwrap();

    let reopened = SessionRegistry::open(&dir).unwrap();
    assert_eq!(reopened.lookup("0123456789abcdef").as_deref(), Some("session-b"));
    assert_eq!(reopened.lookup("fedcba9876543210").as_deref(), Some("session-c"));
    assert_eq!(reopened.lookup("0000000000000000"), None);
}
