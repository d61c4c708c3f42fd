//! Host operations available to generated statements
//!
//! Every awaited call in an oracle turn lands here. Operations that move the
//! agent through its workflows (`Step`, `Call`, `Return`, `Yield`) touch the
//! call stack; the rest talk to the bus or the registry.

use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::agent::{Agent, FrameOutcome};
use super::bus::Message;
use super::checkpoint::TurnProgress;
use super::program::ProgramContext;
use super::state::{CallStackFrame, ParkedTurn};
use crate::interpreter::{ExecError, HostCall, StatementHost, StatementStart, SuspendPoint, Value};

/// Operations generated code may await
pub const HOST_FUNCTIONS: [&str; 9] = [
    "Step",
    "Call",
    "Return",
    "Yield",
    "Say",
    "SendMessage",
    "WaitForMessage",
    "CreateAgent",
    "Agents",
];

fn failure(function: &str, message: impl Into<String>) -> ExecError {
    ExecError::Host {
        function: function.to_string(),
        message: message.into(),
    }
}

fn string_arg<'c>(call: &'c HostCall, position: usize, name: &str) -> Result<&'c str, ExecError> {
    match call.arg(position, name) {
        Some(Value::Str(text)) => Ok(text),
        Some(other) => Err(failure(
            &call.function,
            format!("`{}` must be a str, not {}", name, other.type_name()),
        )),
        None => Err(failure(&call.function, format!("missing argument `{}`", name))),
    }
}

/// Agent id named by a value: an agent reference or its id as a string
fn recipient(function: &str, value: &Value) -> Result<String, ExecError> {
    match value {
        Value::AgentRef(id) | Value::Str(id) => Ok(id.clone()),
        other => Err(failure(
            function,
            format!("cannot address a message to a {}", other.type_name()),
        )),
    }
}

/// Statement host of one oracle turn of one agent
pub(crate) struct AgentHost {
    agent: Arc<Agent>,
    ctx: Arc<ProgramContext>,
    returned: Option<Value>,
    halted: bool,
    closed: bool,
    /// Turn as it stood before the running statement
    statement_start: Option<ParkedTurn>,
    /// Answer for the first `Call` of a resumed caller turn
    replayed_call: Option<Value>,
}

impl AgentHost {
    pub(crate) fn new(agent: Arc<Agent>, ctx: Arc<ProgramContext>) -> Self {
        Self {
            agent,
            ctx,
            returned: None,
            halted: false,
            closed: false,
            statement_start: None,
            replayed_call: None,
        }
    }

    /// Answer the next `Call` with `value` instead of running the workflow
    pub(crate) fn with_replayed_call(mut self, value: Option<Value>) -> Self {
        self.replayed_call = value;
        self
    }

    /// Value passed to `Return`, if the turn returned
    pub(crate) fn returned(&self) -> Option<Value> {
        self.returned.clone()
    }

    /// The bus closed while this turn was waiting
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
        self.halted = true;
    }

    fn step(&mut self, call: &HostCall) -> Result<Value, ExecError> {
        let target = string_arg(call, 0, "step")?;
        let current = self.agent.with_state(|state| {
            state
                .call_stack
                .peek()
                .map(|frame| frame.instruction_pointer.workflow.clone())
        });

        let mut parts = target.split(':');
        let (workflow, label) = match (parts.next(), parts.next()) {
            (Some(workflow), Some(label)) => (workflow.to_string(), label),
            (Some(label), None) => match current {
                Some(workflow) => (workflow, label),
                None => return Err(failure("Step", "no active workflow")),
            },
            _ => return Err(failure("Step", "expected a step like \"Main:03\"")),
        };

        let position = self
            .ctx
            .step_position(self.agent.class_name(), &workflow, label.trim())
            .ok_or_else(|| failure("Step", format!("unknown step `{}`", target)))?;
        tracing::debug!(agent = %self.agent.id(), step = %position, "step");
        if !self
            .agent
            .with_state(|state| state.call_stack.advance(position))
        {
            return Err(failure("Step", "no active frame"));
        }
        Ok(Value::None)
    }

    async fn call_workflow(&mut self, call: &HostCall) -> Result<Value, ExecError> {
        let name = string_arg(call, 0, "workflow")?;
        if let Some(value) = self.replayed_call.take() {
            tracing::debug!(agent = %self.agent.id(), workflow = name, "call already returned before restart");
            return Ok(value);
        }
        let position = self
            .ctx
            .workflow_start(self.agent.class_name(), name)
            .map_err(|e| failure("Call", e.to_string()))?;

        let args: Vec<Value> = call.args.iter().skip(1).cloned().collect();
        let parked = self.statement_start.clone();
        self.agent.with_state(|state| {
            state.set_variable("args", Value::List(args));
            for (key, value) in &call.kwargs {
                if key != "workflow" {
                    state.set_variable(key.clone(), value.clone());
                }
            }
            if let Some(caller) = state.call_stack.peek_mut() {
                caller.parked_turn = parked;
            }
            state.call_stack.push(CallStackFrame::new(position));
        });

        let outcome = self.agent.run_frame(&self.ctx).await;
        if outcome == FrameOutcome::Closed {
            self.close();
            return Ok(Value::None);
        }
        self.agent.with_state(|state| {
            if let Some(caller) = state.call_stack.peek_mut() {
                caller.parked_turn = None;
            }
        });
        match outcome {
            FrameOutcome::Returned(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }

    fn send(&self, function: &str, to: String, content: Value) -> Result<Value, ExecError> {
        self.ctx
            .bus
            .send(Message {
                from: self.agent.id().to_string(),
                to,
                content,
            })
            .map_err(|e| failure(function, e.to_string()))?;
        Ok(Value::None)
    }

    async fn wait_for_message(&mut self, call: &HostCall) -> Result<Value, ExecError> {
        let source = call
            .arg(0, "source")
            .filter(|value| !matches!(value, Value::None))
            .map(|value| recipient("WaitForMessage", value))
            .transpose()?;
        self.agent.with_state(|state| state.set_busy(false));
        let received = self
            .ctx
            .bus
            .receive(self.agent.id(), source.as_deref())
            .await
            .map_err(|e| failure("WaitForMessage", e.to_string()))?;
        self.agent.with_state(|state| state.set_busy(true));
        match received {
            Some(message) => Ok(message.to_value()),
            None => {
                self.close();
                Ok(Value::None)
            }
        }
    }

    fn agents(&self) -> Value {
        Value::List(
            self.ctx
                .registry
                .descriptors()
                .into_iter()
                .map(|peer| {
                    let mut entry = BTreeMap::new();
                    entry.insert("id".to_string(), Value::Str(peer.id));
                    entry.insert("class".to_string(), Value::Str(peer.class));
                    Value::Dict(entry)
                })
                .collect(),
        )
    }
}

impl StatementHost for AgentHost {
    fn is_host_function(&self, name: &str) -> bool {
        HOST_FUNCTIONS.contains(&name)
    }

    fn call(&mut self, call: HostCall) -> BoxFuture<'_, Result<Value, ExecError>> {
        async move {
            match call.function.as_str() {
                "Step" => self.step(&call),
                "Call" => self.call_workflow(&call).await,
                "Return" => {
                    self.returned = Some(call.arg(0, "value").cloned().unwrap_or(Value::None));
                    self.halted = true;
                    Ok(Value::None)
                }
                "Yield" => {
                    self.halted = true;
                    Ok(Value::None)
                }
                "Say" => {
                    let (to, text) = match call.args.len() + call.kwargs.len() {
                        0 => return Err(failure("Say", "nothing to say")),
                        1 => ("user".to_string(), call.arg(0, "message")),
                        _ => (
                            recipient("Say", call.arg(0, "target").unwrap_or(&Value::None))?,
                            call.arg(1, "message"),
                        ),
                    };
                    let text = text.map(ToString::to_string).unwrap_or_default();
                    self.send("Say", to, Value::Str(text))
                }
                "SendMessage" => {
                    let to = call
                        .arg(0, "agent")
                        .ok_or_else(|| failure("SendMessage", "missing argument `agent`"))?;
                    let to = recipient("SendMessage", to)?;
                    let content = call.arg(1, "content").cloned().unwrap_or(Value::None);
                    self.send("SendMessage", to, content)
                }
                "WaitForMessage" => self.wait_for_message(&call).await,
                "CreateAgent" => {
                    let class = string_arg(&call, 0, "class")?;
                    let agent = self
                        .ctx
                        .spawn_agent(class)
                        .map_err(|e| failure("CreateAgent", e.to_string()))?;
                    Ok(Value::AgentRef(agent.id().to_string()))
                }
                "Agents" => Ok(self.agents()),
                other => Err(ExecError::UnknownFunction(other.to_string())),
            }
        }
        .boxed()
    }

    fn get_variable(&self, name: &str) -> Option<Value> {
        self.agent
            .with_state(|state| state.get_variable(name).cloned())
    }

    fn set_variable(&mut self, name: &str, value: Value) {
        self.agent
            .with_state(|state| state.set_variable(name, value));
    }

    fn suspended(&mut self, point: SuspendPoint) {
        let turn = TurnProgress {
            oracle_output: point.oracle_output,
            executed_prefix: point.executed_prefix,
            nested_suspends: point.nested_suspends,
        };
        self.agent
            .checkpoint(&self.ctx, &point.statement, &point.namespace, Some(turn));
    }

    fn statement_started(&mut self, start: StatementStart<'_>) {
        self.statement_start = Some(ParkedTurn {
            namespace: start.namespace.clone(),
            oracle_output: start.oracle_output.to_string(),
            executed_prefix: start.executed_prefix.to_string(),
            call_result: None,
        });
    }

    fn halted(&self) -> bool {
        self.halted
    }
}
