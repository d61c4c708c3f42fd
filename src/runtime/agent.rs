//! Agents and their run loops
//!
//! A fresh agent introduces itself and enters its class entry workflow; a
//! restored agent skips all of that and goes straight to its steady-state
//! loop, which first finishes whatever the restored call stack still holds
//! and then handles incoming messages one at a time.

use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::Instrument;

use super::checkpoint::{AgentCheckpointCoordinator, Checkpoint, TurnProgress};
use super::host::AgentHost;
use super::oracle::OracleRequest;
use super::program::ProgramContext;
use super::registry::AgentClass;
use super::state::{CallStack, CallStackFrame, ExecutionState, InstructionPointer, PeerDescriptor};
use crate::interpreter::{IncrementalStatementExecutor, Namespace, Value};

/// Agent variable holding the value returned by the last finished frame
pub const RETURN_VARIABLE: &str = "_";

/// Agent variable holding the message being handled
pub const MESSAGE_VARIABLE: &str = "message";

/// How an agent task begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Introduce and enter the entry workflow
    Fresh,
    /// Continue from restored state; never re-run begin-of-life
    Restored,
}

/// How a frame ended
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FrameOutcome {
    /// `Return(value)` or an empty turn
    Returned(Value),
    /// Turn or retry budget used up
    Exhausted,
    /// The bus closed while the frame was waiting; the frame stays on the stack
    Closed,
}

struct PendingTurn {
    namespace: Namespace,
    progress: TurnProgress,
}

struct ResumedTurn {
    namespace: Namespace,
    oracle_output: String,
    executed_prefix: String,
    replayed_call: Option<Value>,
}

/// An independently scheduled actor with its own state and inbox
pub struct Agent {
    id: String,
    class: Arc<AgentClass>,
    state: Mutex<ExecutionState>,
    checkpoints: AgentCheckpointCoordinator,
    pending_turn: Mutex<Option<PendingTurn>>,
}

impl Agent {
    /// Create an idle agent
    pub fn new(id: impl Into<String>, class: Arc<AgentClass>, checkpoints: AgentCheckpointCoordinator) -> Self {
        Self {
            id: id.into(),
            class,
            state: Mutex::new(ExecutionState::new()),
            checkpoints,
            pending_turn: Mutex::new(None),
        }
    }

    /// Agent id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Class name
    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    /// Class definition
    pub fn class(&self) -> &AgentClass {
        &self.class
    }

    /// `Class(agent id)`
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(self.id.clone(), self.class.name.clone())
    }

    /// Snapshot of the execution state
    pub fn state(&self) -> ExecutionState {
        self.state.lock().clone()
    }

    /// Snapshot of the call stack
    pub fn call_stack(&self) -> CallStack {
        self.state.lock().call_stack.clone()
    }

    /// Checkpoint coordinator of this agent
    pub fn checkpoints(&self) -> &AgentCheckpointCoordinator {
        &self.checkpoints
    }

    /// Whether a restored, partially executed oracle turn is waiting to resume
    pub fn has_pending_turn(&self) -> bool {
        self.pending_turn.lock().is_some()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ExecutionState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Replace this agent's state with a checkpoint.
    ///
    /// Frames get fresh spans linked to the recorded ones, the checkpoint
    /// counter continues after the restored one, and an in-flight oracle turn
    /// is kept for the steady-state loop to resume.
    pub fn restore_from(&self, checkpoint: &Checkpoint) {
        let frames: Vec<CallStackFrame> = checkpoint
            .metadata
            .call_stack
            .iter()
            .map(CallStackFrame::restored)
            .collect();
        let mut state = checkpoint.execution_state.clone();
        state.call_stack = CallStack::from_frames(frames);

        let pending = match checkpoint.metadata.turn() {
            Some(progress) if !state.call_stack.is_empty() => Some(PendingTurn {
                namespace: checkpoint.namespace.clone(),
                progress,
            }),
            _ => None,
        };

        tracing::info!(
            agent = %self.id,
            counter = checkpoint.metadata.counter,
            stack = %state.call_stack,
            pending_turn = pending.is_some(),
            "agent restored"
        );
        *self.state.lock() = state;
        *self.pending_turn.lock() = pending;
        self.checkpoints.restore_counter(checkpoint.metadata.counter);
    }

    /// Persist the agent; failures are logged and execution continues
    pub(crate) fn checkpoint(
        &self,
        ctx: &ProgramContext,
        statement: &str,
        namespace: &Namespace,
        turn: Option<TurnProgress>,
    ) {
        let peers = ctx.registry.descriptors();
        let state = self.with_state(|state| {
            state.set_peers(peers);
            state.clone()
        });
        if let Err(e) = self.checkpoints.save(statement, namespace, &state, turn) {
            tracing::warn!(
                agent = %self.id,
                statement,
                error = %e,
                "checkpoint failed; continuing without durability for this step"
            );
        }
    }

    fn checkpoint_boundary(&self, ctx: &ProgramContext, reason: &str) {
        self.checkpoint(ctx, reason, &Namespace::new(), None);
    }

    fn push_frame(&self, ctx: &ProgramContext, position: InstructionPointer) {
        let reason = format!("enter {}", position);
        self.with_state(|state| state.call_stack.push(CallStackFrame::new(position)));
        self.checkpoint_boundary(ctx, &reason);
    }

    /// Run the agent until its work is done or the bus closes
    pub(crate) async fn run(self: Arc<Self>, ctx: Arc<ProgramContext>, mode: StartMode) {
        let span = tracing::info_span!("agent", id = %self.id, class = %self.class.name);
        async move {
            tracing::info!(?mode, "agent started");
            if mode == StartMode::Fresh && !self.begin_of_life(&ctx).await {
                return;
            }
            self.steady_state(&ctx).await;
            tracing::info!("agent stopped");
        }
        .instrument(span)
        .await
    }

    /// Introduce the agent and run its entry workflow; false once the bus closed
    async fn begin_of_life(self: &Arc<Self>, ctx: &Arc<ProgramContext>) -> bool {
        ctx.bus.introduce(&self.descriptor(), &self.class.description);
        let Some(entry) = self.class.entry_workflow.as_deref() else {
            return true;
        };
        match ctx.workflow_start(&self.class.name, entry) {
            Ok(position) => self.push_frame(ctx, position),
            Err(e) => {
                tracing::warn!(error = %e, "entry workflow unavailable");
                return true;
            }
        }
        self.run_frames(ctx).await
    }

    async fn steady_state(self: &Arc<Self>, ctx: &Arc<ProgramContext>) {
        if !self.run_frames(ctx).await {
            return;
        }

        loop {
            self.with_state(|state| state.set_busy(false));
            let message = match ctx.bus.receive(&self.id, None).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "inbox unavailable");
                    break;
                }
            };
            tracing::debug!(from = %message.from, "handling message");
            self.with_state(|state| {
                state.set_busy(true);
                state.set_variable(MESSAGE_VARIABLE, message.to_value());
            });

            let handler = self
                .class
                .message_workflow
                .as_deref()
                .map(|workflow| ctx.workflow_start(&self.class.name, workflow));
            match handler {
                Some(Ok(position)) => {
                    self.push_frame(ctx, position);
                    if !self.run_frames(ctx).await {
                        return;
                    }
                }
                Some(Err(e)) => tracing::warn!(error = %e, "message workflow unavailable"),
                None => {
                    tracing::debug!("no message workflow; message kept in $message");
                    self.checkpoint_boundary(ctx, &format!("message from {}", message.from));
                }
            }
        }
    }

    /// Run frames until the stack is empty; false once the bus closed
    async fn run_frames(self: &Arc<Self>, ctx: &Arc<ProgramContext>) -> bool {
        while !self.with_state(|state| state.call_stack.is_empty()) {
            if let FrameOutcome::Closed = self.run_frame(ctx).await {
                return false;
            }
        }
        true
    }

    /// Drive the top frame with oracle turns until it returns, then pop it
    pub(crate) fn run_frame<'a>(
        self: &'a Arc<Self>,
        ctx: &'a Arc<ProgramContext>,
    ) -> BoxFuture<'a, FrameOutcome> {
        async move {
            let Some(frame) = self.with_state(|state| state.call_stack.peek().cloned()) else {
                return FrameOutcome::Exhausted;
            };
            let workflow = frame.instruction_pointer.workflow.clone();
            let span = tracing::info_span!(
                "frame",
                workflow = %workflow,
                span_id = ?frame.tracing_info.as_ref().map(|info| info.span_id),
                linked_span = ?frame.tracing_info.as_ref().and_then(|info| info.linked_span),
            );
            self.drive_frame(ctx, &workflow).instrument(span).await
        }
        .boxed()
    }

    async fn drive_frame(self: &Arc<Self>, ctx: &Arc<ProgramContext>, workflow: &str) -> FrameOutcome {
        let mut corrective = Vec::new();
        let mut retries = 0;
        let mut outcome = None;

        if let Some(resumed) = self.take_resumable_turn() {
            tracing::info!(
                executed = resumed.executed_prefix.len(),
                replayed_call = resumed.replayed_call.is_some(),
                "resuming in-flight turn"
            );
            let host = AgentHost::new(self.clone(), ctx.clone())
                .with_replayed_call(resumed.replayed_call);
            let mut executor = IncrementalStatementExecutor::with_namespace(host, resumed.namespace)
                .with_suspend_warning(ctx.config.unchecked_suspend_warning);
            executor
                .continue_turn(&resumed.oracle_output, &resumed.executed_prefix)
                .await;
            let report = executor.finish().await;
            if let Some(leftover) = report.leftover {
                corrective.push(format!("{} (not executed: {:?})", leftover.error, leftover.text));
            }
            outcome = self.conclude_turn(ctx, executor, &mut corrective, &mut retries);
        }

        let mut turn = 0;
        while outcome.is_none() {
            if turn >= ctx.config.max_turns_per_frame {
                tracing::warn!(turns = turn, "frame used its turn budget; abandoning it");
                outcome = Some(FrameOutcome::Exhausted);
                break;
            }
            turn += 1;

            let Some(position) = self.with_state(|state| {
                state
                    .call_stack
                    .peek()
                    .map(|frame| frame.instruction_pointer.clone())
            }) else {
                outcome = Some(FrameOutcome::Exhausted);
                break;
            };
            let request = OracleRequest {
                agent_id: self.id.clone(),
                agent_class: self.class.name.clone(),
                instructions: ctx.instructions(&self.class.name, &position.workflow),
                position,
                turn,
                corrective: std::mem::take(&mut corrective),
            };
            tracing::debug!(turn, position = %request.position, "oracle turn");

            let host = AgentHost::new(self.clone(), ctx.clone());
            let mut executor = IncrementalStatementExecutor::new(host)
                .with_suspend_warning(ctx.config.unchecked_suspend_warning);
            let mut stream = ctx.oracle.stream_turn(&request);
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(text) => {
                        if executor.feed(&text).await.halted {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "oracle stream failed");
                        corrective.push(format!("the previous turn was cut off: {}", e));
                        break;
                    }
                }
            }
            let report = executor.finish().await;
            if let Some(leftover) = report.leftover {
                corrective.push(format!("{} (not executed: {:?})", leftover.error, leftover.text));
            }
            outcome = self.conclude_turn(ctx, executor, &mut corrective, &mut retries);
        }

        let outcome = outcome.unwrap_or(FrameOutcome::Exhausted);
        if outcome != FrameOutcome::Closed {
            self.with_state(|state| {
                state.call_stack.pop();
                let result = match &outcome {
                    FrameOutcome::Returned(value) => {
                        state.set_variable(RETURN_VARIABLE, value.clone());
                        value.clone()
                    }
                    _ => Value::None,
                };
                if let Some(parked) = state
                    .call_stack
                    .peek_mut()
                    .and_then(|caller| caller.parked_turn.as_mut())
                {
                    parked.call_result = Some(result);
                }
            });
            self.checkpoint_boundary(ctx, &format!("return from {}", workflow));
        }
        outcome
    }

    /// Turn to continue before asking the oracle again: the restored
    /// in-flight turn, or the top frame's turn parked on a `Call`
    fn take_resumable_turn(&self) -> Option<ResumedTurn> {
        if let Some(pending) = self.pending_turn.lock().take() {
            return Some(ResumedTurn {
                namespace: pending.namespace,
                oracle_output: pending.progress.oracle_output,
                executed_prefix: pending.progress.executed_prefix,
                replayed_call: None,
            });
        }
        let parked = self.with_state(|state| {
            state
                .call_stack
                .peek_mut()
                .and_then(|frame| frame.parked_turn.take())
        })?;
        if parked.call_result.is_none() {
            tracing::debug!("parked turn has no call result; the call runs again");
        }
        Some(ResumedTurn {
            namespace: parked.namespace,
            oracle_output: parked.oracle_output,
            executed_prefix: parked.executed_prefix,
            replayed_call: parked.call_result,
        })
    }

    fn conclude_turn(
        &self,
        ctx: &ProgramContext,
        mut executor: IncrementalStatementExecutor<AgentHost>,
        corrective: &mut Vec<String>,
        retries: &mut usize,
    ) -> Option<FrameOutcome> {
        let failures = executor.take_errors();
        let empty = executor.output().trim().is_empty();
        let (host, _) = executor.into_parts();

        if host.is_closed() {
            return Some(FrameOutcome::Closed);
        }
        if let Some(value) = host.returned() {
            return Some(FrameOutcome::Returned(value));
        }
        if !failures.is_empty() {
            if *retries >= ctx.config.max_statement_retries {
                tracing::warn!(failures = failures.len(), "statement errors persist after corrective turns");
                return Some(FrameOutcome::Exhausted);
            }
            *retries += 1;
            tracing::debug!(failures = failures.len(), retry = *retries, "asking for a corrective turn");
            corrective.extend(failures.iter().map(ToString::to_string));
            return None;
        }
        if empty {
            return Some(FrameOutcome::Returned(Value::None));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Codec;
    use crate::runtime::checkpoint::CheckpointMetadata;
    use crate::runtime::state::ParkedTurn;
    use crate::runtime::storage::{CheckpointStore, MemoryCheckpointStore};
    use chrono::Utc;

    fn agent() -> Agent {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let class = Arc::new(AgentClass {
            name: "Planner".to_string(),
            description: String::new(),
            entry_workflow: Some("Main".to_string()),
            message_workflow: None,
            startup: true,
        });
        let checkpoints = AgentCheckpointCoordinator::new("1000", store, Codec::Json).unwrap();
        Agent::new("1000", class, checkpoints)
    }

    fn checkpoint(counter: u64, frames: Vec<CallStackFrame>, turn: bool) -> Checkpoint {
        let mut namespace = Namespace::new();
        namespace.set("x", Value::Int(10));
        Checkpoint {
            namespace,
            execution_state: ExecutionState::new(),
            metadata: CheckpointMetadata {
                statement: "await Say('hi')".to_string(),
                oracle_output: turn.then(|| "x = 10\nawait Say('hi')\ny = 20\n".to_string()),
                executed_prefix: turn.then(|| "x = 10\nawait Say('hi')\n".to_string()),
                counter,
                timestamp: Utc::now(),
                call_stack: frames,
                nested_suspends: 1,
            },
        }
    }

    #[test]
    fn restore_rebuilds_stack_with_linked_spans() {
        let agent = agent();
        let frames = vec![
            CallStackFrame::new(InstructionPointer::new("Main", "01", 4)),
            CallStackFrame::new(InstructionPointer::new("Main", "03", 6)),
        ];
        agent.restore_from(&checkpoint(16, frames.clone(), true));

        let stack = agent.call_stack();
        assert_eq!(stack.to_string(), "Main:01, Main:03");
        let restored = stack.frames()[1].tracing_info.clone().unwrap();
        assert_eq!(
            restored.linked_span,
            frames[1].tracing_info.as_ref().map(|info| info.span_id)
        );
        assert!(agent.has_pending_turn());
        assert_eq!(agent.checkpoints().counter(), 16);
    }

    #[test]
    fn restore_keeps_parked_caller_turns() {
        let agent = agent();
        let mut scope = Namespace::new();
        scope.set("count", Value::Int(2));
        let mut caller = CallStackFrame::new(InstructionPointer::new("Main", "02", 5));
        caller.parked_turn = Some(ParkedTurn {
            namespace: scope,
            oracle_output: "await Say('a')\nr = await Call('Review')\n".to_string(),
            executed_prefix: "await Say('a')\n".to_string(),
            call_result: Some(Value::from("ok")),
        });
        let callee = CallStackFrame::new(InstructionPointer::new("Review", "01", 9));
        agent.restore_from(&checkpoint(4, vec![caller.clone(), callee], false));

        let stack = agent.call_stack();
        assert_eq!(
            stack.positions(),
            vec![
                InstructionPointer::new("Main", "02", 5),
                InstructionPointer::new("Review", "01", 9),
            ]
        );
        assert_eq!(stack.frames()[0].parked_turn, caller.parked_turn);
        assert!(stack.frames()[1].parked_turn.is_none());
        assert!(!agent.has_pending_turn());

        let resumed = agent.take_resumable_turn();
        assert!(resumed.is_none(), "the callee on top has nothing parked");
        agent.with_state(|state| state.call_stack.pop());
        let resumed = agent.take_resumable_turn().unwrap();
        assert_eq!(resumed.executed_prefix, "await Say('a')\n");
        assert_eq!(resumed.replayed_call, Some(Value::from("ok")));
        assert_eq!(resumed.namespace.get("count"), Some(&Value::Int(2)));
        assert!(agent.call_stack().frames()[0].parked_turn.is_none());
    }

    #[test]
    fn idle_checkpoint_restores_without_pending_turn() {
        let agent = agent();
        agent.restore_from(&checkpoint(3, Vec::new(), true));
        assert!(agent.call_stack().is_empty());
        assert!(!agent.has_pending_turn());
    }
}
