//! Per-agent execution state: variables, call stack, and known peers
//!
//! Pure data with small mutators. Everything here round-trips through a
//! checkpoint except the transient `busy` flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::interpreter::{Namespace, Value};

/// Position inside a workflow: `(workflow, line label, source line)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstructionPointer {
    /// Workflow name
    pub workflow: String,
    /// Step label, e.g. `03`
    pub line: String,
    /// Line in the workflow source file (0 when unknown)
    pub source_line: u32,
}

impl InstructionPointer {
    /// Create an instruction pointer
    pub fn new(workflow: impl Into<String>, line: impl Into<String>, source_line: u32) -> Self {
        Self {
            workflow: workflow.into(),
            line: line.into(),
            source_line,
        }
    }
}

impl fmt::Display for InstructionPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workflow, self.line)
    }
}

/// Observability handle attached to a frame.
///
/// Live spans cannot survive a process boundary; a restored frame gets a new
/// span id that links back to the one recorded in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingInfo {
    /// Span identifier
    pub span_id: Uuid,
    /// When the span started
    pub started_at: DateTime<Utc>,
    /// Span this one continues, if it was created by a restore
    pub linked_span: Option<Uuid>,
}

impl TracingInfo {
    /// Start a new span
    pub fn new() -> Self {
        Self {
            span_id: Uuid::new_v4(),
            started_at: Utc::now(),
            linked_span: None,
        }
    }

    /// A fresh span linked to this one
    pub fn relinked(&self) -> Self {
        Self {
            span_id: Uuid::new_v4(),
            started_at: Utc::now(),
            linked_span: Some(self.span_id),
        }
    }
}

impl Default for TracingInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Oracle turn of a frame that is waiting on a `Call` it made.
///
/// The turn is cut just before the calling statement; when the callee
/// returns, that statement runs again with the call answered by
/// `call_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedTurn {
    /// Local namespace before the calling statement
    pub namespace: Namespace,
    /// Oracle output received so far
    pub oracle_output: String,
    /// Output executed before the calling statement
    pub executed_prefix: String,
    /// What the callee returned, once it has
    pub call_result: Option<Value>,
}

/// One frame of the call stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStackFrame {
    /// Current position of the frame
    pub instruction_pointer: InstructionPointer,
    /// Span handle
    pub tracing_info: Option<TracingInfo>,
    /// Set while a frame above this one runs on its behalf
    #[serde(default)]
    pub parked_turn: Option<ParkedTurn>,
}

impl CallStackFrame {
    /// Frame with a new span
    pub fn new(instruction_pointer: InstructionPointer) -> Self {
        Self {
            instruction_pointer,
            tracing_info: Some(TracingInfo::new()),
            parked_turn: None,
        }
    }

    /// Copy of this frame for a restored process
    pub fn restored(&self) -> Self {
        Self {
            instruction_pointer: self.instruction_pointer.clone(),
            tracing_info: Some(
                self.tracing_info
                    .as_ref()
                    .map(TracingInfo::relinked)
                    .unwrap_or_default(),
            ),
            parked_turn: self.parked_turn.clone(),
        }
    }
}

/// Ordered frames; the last one is the current position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallStack {
    frames: Vec<CallStackFrame>,
}

impl CallStack {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack made of the given frames, bottom first
    pub fn from_frames(frames: Vec<CallStackFrame>) -> Self {
        Self { frames }
    }

    /// Push a frame
    pub fn push(&mut self, frame: CallStackFrame) {
        self.frames.push(frame);
    }

    /// Pop the current frame
    pub fn pop(&mut self) -> Option<CallStackFrame> {
        self.frames.pop()
    }

    /// Current frame
    pub fn peek(&self) -> Option<&CallStackFrame> {
        self.frames.last()
    }

    /// Current frame, mutably
    pub fn peek_mut(&mut self) -> Option<&mut CallStackFrame> {
        self.frames.last_mut()
    }

    /// Move the current frame to a new position; false on an empty stack
    pub fn advance(&mut self, instruction_pointer: InstructionPointer) -> bool {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.instruction_pointer = instruction_pointer;
                true
            }
            None => false,
        }
    }

    /// Number of frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether the agent has no pending work
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames, bottom first
    pub fn frames(&self) -> &[CallStackFrame] {
        &self.frames
    }

    /// Instruction pointers, bottom first
    pub fn positions(&self) -> Vec<InstructionPointer> {
        self.frames
            .iter()
            .map(|frame| frame.instruction_pointer.clone())
            .collect()
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, frame) in self.frames.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", frame.instruction_pointer)?;
        }
        Ok(())
    }
}

/// Known agent, serialized as `Class(agent id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerDescriptor {
    /// Agent id
    pub id: String,
    /// Agent class
    pub class: String,
}

impl PeerDescriptor {
    /// Create a descriptor
    pub fn new(id: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
        }
    }

    /// Parse `Class(agent id)`
    pub fn parse(text: &str) -> Option<Self> {
        let (class, rest) = text.trim().split_once("(agent ")?;
        let id = rest.strip_suffix(')')?;
        if class.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(id, class))
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(agent {})", self.class, self.id)
    }
}

impl Serialize for PeerDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        PeerDescriptor::parse(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid agent descriptor '{}'", text)))
    }
}

/// State owned by one agent.
///
/// The call stack travels in checkpoint metadata rather than in this
/// struct's serialized form, so it is skipped here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Agent-level variables (`$name` in generated code)
    pub variables: BTreeMap<String, Value>,
    /// Call stack
    #[serde(skip)]
    pub call_stack: CallStack,
    /// Agents this one knows about, itself included
    pub peers: Vec<PeerDescriptor>,
    #[serde(skip)]
    busy: bool,
}

impl ExecutionState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a variable
    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Write a variable
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Replace the peer list
    pub fn set_peers(&mut self, mut peers: Vec<PeerDescriptor>) {
        peers.sort();
        peers.dedup();
        self.peers = peers;
    }

    /// Class recorded for `agent_id` in the peer list
    pub fn peer_class(&self, agent_id: &str) -> Option<&str> {
        self.peers
            .iter()
            .find(|peer| peer.id == agent_id)
            .map(|peer| peer.class.as_str())
    }

    /// Whether the agent is processing work
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Mark the agent busy or idle
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_pointer_renders_workflow_and_line() {
        let ip = InstructionPointer::new("Main", "03", 12);
        assert_eq!(ip.to_string(), "Main:03");
        assert_eq!(ip, InstructionPointer::new("Main", "03", 12));
        assert_ne!(ip, InstructionPointer::new("Main", "03", 13));
    }

    #[test]
    fn call_stack_depth_tracks_frames() {
        let mut stack = CallStack::new();
        assert!(stack.is_empty());
        stack.push(CallStackFrame::new(InstructionPointer::new("Main", "01", 3)));
        stack.push(CallStackFrame::new(InstructionPointer::new("Helper", "01", 9)));
        assert_eq!(stack.depth(), 2);
        assert!(stack.advance(InstructionPointer::new("Helper", "02", 10)));
        assert_eq!(stack.to_string(), "Main:01, Helper:02");
        stack.pop();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.peek().unwrap().instruction_pointer.workflow, "Main");
    }

    #[test]
    fn restored_frame_links_to_original_span() {
        let frame = CallStackFrame::new(InstructionPointer::new("Main", "01", 1));
        let original = frame.tracing_info.clone().unwrap();
        let restored = frame.restored();
        let info = restored.tracing_info.unwrap();
        assert_ne!(info.span_id, original.span_id);
        assert_eq!(info.linked_span, Some(original.span_id));
        assert_eq!(restored.instruction_pointer, frame.instruction_pointer);
    }

    #[test]
    fn peer_descriptors_round_trip_through_strings() {
        let peer = PeerDescriptor::new("1001", "Seller");
        assert_eq!(peer.to_string(), "Seller(agent 1001)");
        assert_eq!(PeerDescriptor::parse("Seller(agent 1001)"), Some(peer.clone()));
        assert_eq!(PeerDescriptor::parse("Seller 1001"), None);

        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, "\"Seller(agent 1001)\"");
        let back: PeerDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }

    #[test]
    fn busy_flag_and_stack_are_not_serialized() {
        let mut state = ExecutionState::new();
        state.set_busy(true);
        state.set_variable("order", Value::Int(3));
        state
            .call_stack
            .push(CallStackFrame::new(InstructionPointer::new("Main", "01", 1)));

        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("busy").is_none());
        assert!(json.get("call_stack").is_none());

        let back: ExecutionState = serde_json::from_value(json).unwrap();
        assert!(!back.is_busy());
        assert!(back.call_stack.is_empty());
        assert_eq!(back.get_variable("order"), Some(&Value::Int(3)));
    }
}
