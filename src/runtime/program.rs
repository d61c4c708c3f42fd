//! Program: the owner of all agents of one session
//!
//! `prepare` picks the session and either restores it or creates the startup
//! agents; `start` spawns one tokio task per agent; `wait` joins them (and
//! any agent created while running) and returns the transcript.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use super::RuntimeConfig;
use super::agent::{Agent, StartMode};
use super::bus::{Message, MessageBus, TranscriptEntry};
use super::checkpoint::{AgentCheckpointCoordinator, CheckpointListener};
use super::error::{AgentError, AgentResult, RestoreError, Result, RuntimeError};
use super::oracle::Oracle;
use super::program_checkpoint::{AgentFactory, ProgramCheckpointCoordinator, RestoreReport};
use super::recovery::{RecoveryCoordinator, RecoveryPhase, ResumeRequest};
use super::registry::{AgentCatalog, AgentRegistry};
use super::session::SessionRegistry;
use super::state::{InstructionPointer, PeerDescriptor};
use super::storage::{self, CheckpointStore, FilesystemCheckpointStore};
use super::workflow::WorkflowSet;
use crate::interpreter::Value;

/// Shared by every agent task of a program
pub(crate) struct ProgramContext {
    pub(crate) config: RuntimeConfig,
    pub(crate) bus: Arc<MessageBus>,
    pub(crate) oracle: Arc<dyn Oracle>,
    pub(crate) workflows: Arc<WorkflowSet>,
    pub(crate) catalog: AgentCatalog,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) program_checkpoints: Arc<ProgramCheckpointCoordinator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProgramContext {
    fn build_agent(&self, class: &str, id: &str) -> AgentResult<Arc<Agent>> {
        let class = self.catalog.get(class)?;
        let listener: Weak<ProgramCheckpointCoordinator> = Arc::downgrade(&self.program_checkpoints);
        let listener: Weak<dyn CheckpointListener> = listener;
        let checkpoints = AgentCheckpointCoordinator::new(id, self.store.clone(), self.config.codec)?
            .with_retention(self.config.keep_last)
            .with_listener(listener);
        self.bus.register_mailbox(id);
        Ok(Arc::new(Agent::new(id, class, checkpoints)))
    }

    /// Create and start a fresh agent while the program runs
    pub(crate) fn spawn_agent(self: &Arc<Self>, class: &str) -> AgentResult<Arc<Agent>> {
        let id = self.registry.allocate_id();
        let agent = self.build_agent(class, &id)?;
        self.registry.insert(agent.clone())?;
        let peers = self.registry.descriptors();
        agent.with_state(|state| state.set_peers(peers));
        tracing::info!(agent = %id, class, "agent created");
        self.spawn(agent.clone(), StartMode::Fresh);
        Ok(agent)
    }

    pub(crate) fn spawn(self: &Arc<Self>, agent: Arc<Agent>, mode: StartMode) {
        self.bus.agent_started();
        let ctx = self.clone();
        let handle = tokio::spawn(async move {
            let bus = ctx.bus.clone();
            agent.run(ctx, mode).await;
            bus.agent_stopped();
        });
        self.tasks.lock().push(handle);
    }

    /// First step of a workflow of `class`
    pub(crate) fn workflow_start(&self, class: &str, workflow: &str) -> AgentResult<InstructionPointer> {
        self.workflows
            .class(class)
            .and_then(|def| def.workflow(workflow))
            .map(|wf| wf.first_position())
            .ok_or_else(|| AgentError::UnknownWorkflow {
                class: class.to_string(),
                workflow: workflow.to_string(),
            })
    }

    /// Position of a labelled step
    pub(crate) fn step_position(&self, class: &str, workflow: &str, label: &str) -> Option<InstructionPointer> {
        let step = self.workflows.class(class)?.workflow(workflow)?.locate(label)?;
        Some(InstructionPointer::new(workflow, &step.label, step.source_line))
    }

    /// Workflow text handed to the oracle
    pub(crate) fn instructions(&self, class: &str, workflow: &str) -> String {
        self.workflows
            .class(class)
            .and_then(|def| def.workflow(workflow))
            .map(|wf| wf.instructions())
            .unwrap_or_default()
    }
}

impl AgentFactory for ProgramContext {
    fn has_class(&self, class: &str) -> bool {
        self.catalog.contains(class)
    }

    fn create_agent(&self, class: &str, id: &str) -> AgentResult<Arc<Agent>> {
        let agent = self.build_agent(class, id)?;
        self.registry.insert_with_id(agent.clone())?;
        Ok(agent)
    }

    fn discard_agent(&self, id: &str) {
        self.registry.remove(id);
    }
}

/// What `prepare` decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    /// Session the program runs in
    pub session_id: String,
    /// Whether agents were restored from checkpoints
    pub resumed: bool,
    /// Restore outcome, when a restore succeeded
    pub restore: Option<RestoreReport>,
    /// Agents about to start
    pub agents: Vec<PeerDescriptor>,
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramReport {
    /// Session the program ran in
    pub session_id: String,
    /// Messages and introductions addressed to the human side
    pub transcript: Vec<TranscriptEntry>,
    /// Agents alive at the end
    pub agents: Vec<PeerDescriptor>,
}

/// A multi-agent program bound to one session
pub struct Program {
    config: RuntimeConfig,
    workflows: Arc<WorkflowSet>,
    oracle: Arc<dyn Oracle>,
    catalog: AgentCatalog,
    ctx: Option<Arc<ProgramContext>>,
    recovery: Option<RecoveryCoordinator>,
    pending: Vec<(Arc<Agent>, StartMode)>,
}

impl Program {
    /// Create a program; nothing touches disk until [`prepare`](Self::prepare)
    pub fn new(config: RuntimeConfig, workflows: WorkflowSet, oracle: Arc<dyn Oracle>) -> Self {
        let catalog = AgentCatalog::from_workflows(&workflows);
        Self {
            config,
            workflows: Arc::new(workflows),
            oracle,
            catalog,
            ctx: None,
            recovery: None,
            pending: Vec::new(),
        }
    }

    fn build_context(&self, session_id: &str) -> Result<Arc<ProgramContext>> {
        if !storage::is_safe_execution_id(session_id) {
            return Err(RuntimeError::Config(format!(
                "session id '{}' cannot be used as a directory name",
                session_id
            )));
        }
        let store: Arc<dyn CheckpointStore> = Arc::new(FilesystemCheckpointStore::new(
            self.config.session_dir(session_id),
            self.config.max_checkpoint_bytes,
        ));
        let registry = Arc::new(AgentRegistry::new());
        let program_checkpoints = Arc::new(
            ProgramCheckpointCoordinator::new(session_id, store.clone(), self.config.codec, registry.clone())?
                .with_retention(self.config.keep_last),
        );
        Ok(Arc::new(ProgramContext {
            config: self.config.clone(),
            bus: Arc::new(MessageBus::new(self.config.shutdown_when_idle)),
            oracle: self.oracle.clone(),
            workflows: self.workflows.clone(),
            catalog: self.catalog.clone(),
            registry,
            store,
            program_checkpoints,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    fn fresh_agents(&mut self, ctx: &Arc<ProgramContext>) -> Result<()> {
        for class in self.catalog.startup_classes() {
            let id = ctx.registry.allocate_id();
            let agent = ctx.build_agent(&class.name, &id)?;
            ctx.registry.insert(agent.clone())?;
            self.pending.push((agent, StartMode::Fresh));
        }
        let peers = ctx.registry.descriptors();
        for (agent, _) in &self.pending {
            agent.with_state(|state| state.set_peers(peers.clone()));
        }
        Ok(())
    }

    /// Select the session and bring agents into existence.
    ///
    /// A resume that finds no checkpoints starts fresh in the same session;
    /// a resume whose restore fails starts fresh in a new session.
    pub fn prepare(&mut self, request: ResumeRequest) -> Result<StartReport> {
        if self.ctx.is_some() {
            return Err(RuntimeError::Config("program was already prepared".to_string()));
        }
        storage::init_storage(&self.config.root)?;
        let sessions = SessionRegistry::open(&self.config.checkpoints_dir())?;
        let mut recovery = RecoveryCoordinator::new(sessions, &request, self.workflows.paths())?;
        let plan = recovery.select_session(&request)?;

        let mut ctx = self.build_context(&plan.session_id)?;
        let mut restore = None;
        if plan.resume {
            match ctx.program_checkpoints.restore(ctx.as_ref()) {
                Ok(report) => {
                    for id in &report.restored {
                        if let Some(agent) = ctx.registry.get(id) {
                            self.pending.push((agent, StartMode::Restored));
                        }
                    }
                    for id in &report.fresh {
                        if let Some(agent) = ctx.registry.get(id) {
                            self.pending.push((agent, StartMode::Fresh));
                        }
                    }
                    restore = Some(report);
                }
                Err(RestoreError::NoProgramCheckpoint(session)) => {
                    tracing::warn!(session = %session, "nothing to resume; starting fresh");
                    recovery.fresh_in_session()?;
                    self.fresh_agents(&ctx)?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "restore failed; starting fresh in a new session");
                    let session_id = recovery.fall_back_to_fresh()?;
                    ctx = self.build_context(&session_id)?;
                    self.fresh_agents(&ctx)?;
                }
            }
        } else {
            self.fresh_agents(&ctx)?;
        }

        let report = StartReport {
            session_id: ctx.program_checkpoints.session_id().to_string(),
            resumed: restore.is_some(),
            restore,
            agents: ctx.registry.descriptors(),
        };
        tracing::info!(
            session = %report.session_id,
            resumed = report.resumed,
            agents = report.agents.len(),
            "program prepared"
        );
        self.ctx = Some(ctx);
        self.recovery = Some(recovery);
        Ok(report)
    }

    fn context(&self) -> Result<&Arc<ProgramContext>> {
        self.ctx
            .as_ref()
            .ok_or_else(|| RuntimeError::Config("program has not been prepared".to_string()))
    }

    /// Spawn every prepared agent. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        let ctx = self.context()?.clone();
        let _hold = ctx.bus.hold();
        for (agent, mode) in self.pending.drain(..) {
            ctx.spawn(agent, mode);
        }
        if let Some(recovery) = self.recovery.as_mut() {
            recovery.running()?;
        }
        Ok(())
    }

    /// Wait until every agent task, including ones created while running, ended
    pub async fn wait(&self) -> Result<ProgramReport> {
        let ctx = self.context()?;
        loop {
            let handles = std::mem::take(&mut *ctx.tasks.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        tracing::warn!(error = %e, "agent task failed");
                    }
                }
            }
        }
        Ok(ProgramReport {
            session_id: ctx.program_checkpoints.session_id().to_string(),
            transcript: ctx.bus.transcript(),
            agents: ctx.registry.descriptors(),
        })
    }

    /// Prepare, start, and wait
    pub async fn run(&mut self, request: ResumeRequest) -> Result<ProgramReport> {
        self.prepare(request)?;
        self.start()?;
        self.wait().await
    }

    /// Stop every agent task where it stands, as a process kill would
    pub fn abort(&self) {
        if let Some(ctx) = &self.ctx {
            for handle in ctx.tasks.lock().iter() {
                handle.abort();
            }
        }
    }

    /// Post a message from the human side
    pub fn post(&self, to: &str, content: Value) -> Result<()> {
        let ctx = self.context()?;
        ctx.bus.send(Message {
            from: "user".to_string(),
            to: to.to_string(),
            content,
        })?;
        Ok(())
    }

    /// Live agent by id
    pub fn agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.ctx.as_ref()?.registry.get(id)
    }

    /// All live agents
    pub fn agents(&self) -> Vec<Arc<Agent>> {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.registry.list())
            .unwrap_or_default()
    }

    /// Message bus, once prepared
    pub fn bus(&self) -> Option<Arc<MessageBus>> {
        self.ctx.as_ref().map(|ctx| ctx.bus.clone())
    }

    /// Session id, once prepared
    pub fn session_id(&self) -> Option<&str> {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.program_checkpoints.session_id())
    }

    /// Startup phase, once prepared
    pub fn phase(&self) -> Option<RecoveryPhase> {
        self.recovery.as_ref().map(RecoveryCoordinator::phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::oracle::ScriptedOracle;
    use tempfile::TempDir;

    const WORKFLOWS: &str = "\
# Greeter
Says hello.

## Main
trigger: begin
- 01: Greet the user
";

    #[tokio::test]
    async fn fresh_run_introduces_and_greets() {
        let temp = TempDir::new().unwrap();
        let oracle = Arc::new(ScriptedOracle::new().script(
            "Greeter",
            ["await Step('Main:01')\nawait Say('user', 'hello')\nawait Return(1)\n"],
        ));
        let mut program = Program::new(
            RuntimeConfig::with_root(temp.path().join(".encore")),
            WorkflowSet::from_source(WORKFLOWS).unwrap(),
            oracle,
        );

        let report = program.run(ResumeRequest::Fresh).await.unwrap();
        let contents: Vec<&str> = report
            .transcript
            .iter()
            .map(|entry| entry.content.as_str())
            .collect();
        assert_eq!(contents, vec!["Greeter(agent 1000): Says hello.", "hello"]);
        assert_eq!(program.phase(), Some(RecoveryPhase::Running));

        let agent = program.agent("1000").unwrap();
        assert!(agent.call_stack().is_empty());
        assert_eq!(agent.state().get_variable("_"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn prepare_twice_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut program = Program::new(
            RuntimeConfig::with_root(temp.path()),
            WorkflowSet::from_source(WORKFLOWS).unwrap(),
            Arc::new(ScriptedOracle::new()),
        );
        program.prepare(ResumeRequest::Fresh).unwrap();
        assert!(matches!(
            program.prepare(ResumeRequest::Fresh),
            Err(RuntimeError::Config(_))
        ));
    }
}
