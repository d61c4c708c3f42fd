//! Program-level checkpoint index and whole-program restore
//!
//! A program checkpoint records, for one session, the newest checkpoint id
//! of every live agent. It is rewritten after every agent checkpoint and is a
//! best-effort consistent cut: at restore time each agent is brought back
//! from its own newest checkpoint, not from the possibly stale pointer.
//!
//! Restore is two-pass. Agents created mid-run by other agents are unknown
//! to a freshly started program, so the first pass recreates every missing
//! agent with its original id (recovering its class from checkpointed peer
//! lists); the second pass applies each agent's checkpoint. Everything that
//! can fail is validated before anything is created.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::Codec;
use super::agent::Agent;
use super::checkpoint::{
    Checkpoint, CheckpointId, CheckpointListener, decode_blob, encode_blob, load_checkpoint,
};
use super::error::{AgentResult, CheckpointResult, RestoreError, RestoreResult};
use super::registry::AgentRegistry;
use super::state::PeerDescriptor;
use super::storage::CheckpointStore;

/// Index of the newest checkpoint of every agent in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramCheckpoint {
    /// Session id
    pub session_id: String,
    /// Counter of this program checkpoint
    pub checkpoint_counter: u64,
    /// Agent id → newest checkpoint id at save time
    pub agents: BTreeMap<String, CheckpointId>,
    /// Live agents that had not checkpointed yet
    #[serde(default)]
    pub pending_agents: Vec<PeerDescriptor>,
    /// Number of live agents
    pub agent_count: usize,
    /// When the index was written
    pub timestamp: DateTime<Utc>,
}

/// Creates agents during restore
pub trait AgentFactory {
    /// Whether `class` can be instantiated
    fn has_class(&self, class: &str) -> bool;

    /// Instantiate and register an agent with a fixed id
    fn create_agent(&self, class: &str, id: &str) -> AgentResult<Arc<Agent>>;

    /// Undo [`create_agent`](Self::create_agent) after a failed restore
    fn discard_agent(&self, id: &str);
}

/// Outcome of a successful restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Agents restored from their checkpoints
    pub restored: Vec<String>,
    /// Agents recreated without a checkpoint; they start fresh
    pub fresh: Vec<String>,
    /// Agents the program checkpoint expected
    pub expected: usize,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} agents restored", self.restored.len(), self.expected)?;
        if !self.fresh.is_empty() {
            write!(f, " ({} started fresh)", self.fresh.len())?;
        }
        Ok(())
    }
}

struct PlannedAgent {
    id: String,
    class: String,
    checkpoint: Option<Checkpoint>,
    live: Option<Arc<Agent>>,
}

/// Writes program checkpoints and restores whole programs
pub struct ProgramCheckpointCoordinator {
    session_id: String,
    execution_id: String,
    store: Arc<dyn CheckpointStore>,
    codec: Codec,
    keep_last: usize,
    registry: Arc<AgentRegistry>,
    counter: Mutex<u64>,
}

impl ProgramCheckpointCoordinator {
    /// Create a coordinator; the counter continues after the newest index
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        codec: Codec,
        registry: Arc<AgentRegistry>,
    ) -> CheckpointResult<Self> {
        let session_id = session_id.into();
        let execution_id = format!("{}_program", session_id);
        let counter = store
            .latest(&execution_id)?
            .map(|id| id.counter())
            .unwrap_or(0);
        Ok(Self {
            session_id,
            execution_id,
            store,
            codec,
            keep_last: 0,
            registry,
            counter: Mutex::new(counter),
        })
    }

    /// Keep only the newest `keep_last` indexes (0 keeps all)
    pub fn with_retention(mut self, keep_last: usize) -> Self {
        self.keep_last = keep_last;
        self
    }

    /// Session id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// `{session_id}_program`
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Record the newest checkpoint of every live agent
    pub fn save(&self) -> CheckpointResult<CheckpointId> {
        // Held for the whole save so a higher counter never carries an older cut.
        let mut counter = self.counter.lock();

        let mut agents = BTreeMap::new();
        let mut pending_agents = Vec::new();
        let live = self.registry.list();
        for agent in &live {
            match agent.checkpoints().latest_id()? {
                Some(id) => {
                    agents.insert(agent.id().to_string(), id);
                }
                None => pending_agents.push(agent.descriptor()),
            }
        }

        *counter += 1;
        let id = CheckpointId::new(self.execution_id.clone(), *counter);
        let checkpoint = ProgramCheckpoint {
            session_id: self.session_id.clone(),
            checkpoint_counter: *counter,
            agents,
            pending_agents,
            agent_count: live.len(),
            timestamp: Utc::now(),
        };
        self.store.put(&id, &encode_blob(&checkpoint, self.codec)?)?;
        if self.keep_last > 0 {
            self.store.prune(&self.execution_id, self.keep_last)?;
        }
        tracing::debug!(checkpoint = %id, agents = live.len(), "program checkpoint saved");
        Ok(id)
    }

    /// Newest program checkpoint of the session
    pub fn latest(&self) -> CheckpointResult<Option<ProgramCheckpoint>> {
        let Some(id) = self.store.latest(&self.execution_id)? else {
            return Ok(None);
        };
        match self.store.get(&id)? {
            Some(blob) => decode_blob(&blob).map(Some),
            None => Ok(None),
        }
    }

    /// Bring back every agent referenced by the newest program checkpoint.
    ///
    /// All-or-nothing: on error no agent has been modified and agents
    /// created by this call have been discarded again.
    pub fn restore(&self, factory: &dyn AgentFactory) -> RestoreResult<RestoreReport> {
        let program = self
            .latest()
            .map_err(|e| RestoreError::Corrupt {
                checkpoint: format!("{}_ckpt_latest", self.execution_id),
                detail: e.to_string(),
            })?
            .ok_or_else(|| RestoreError::NoProgramCheckpoint(self.session_id.clone()))?;
        tracing::info!(
            session = %self.session_id,
            counter = program.checkpoint_counter,
            agents = program.agent_count,
            "restoring program"
        );

        let plan = self.plan(&program, factory)?;

        // Pass 1: make sure every referenced agent exists, with its original id.
        let mut created: Vec<String> = Vec::new();
        let mut agents = Vec::with_capacity(plan.len());
        for entry in &plan {
            let agent = match &entry.live {
                Some(agent) => agent.clone(),
                None => match factory.create_agent(&entry.class, &entry.id) {
                    Ok(agent) => {
                        tracing::info!(agent = %entry.id, class = %entry.class, "recreated agent");
                        created.push(entry.id.clone());
                        agent
                    }
                    Err(e) => {
                        for id in &created {
                            factory.discard_agent(id);
                        }
                        return Err(e.into());
                    }
                },
            };
            agents.push(agent);
        }

        // Pass 2: apply each agent's own newest checkpoint.
        let mut report = RestoreReport {
            expected: program.agent_count.max(plan.len()),
            ..RestoreReport::default()
        };
        for (entry, agent) in plan.into_iter().zip(agents) {
            match entry.checkpoint {
                Some(checkpoint) => {
                    agent.restore_from(&checkpoint);
                    report.restored.push(entry.id);
                }
                None => report.fresh.push(entry.id),
            }
        }

        self.resume_counter(program.checkpoint_counter);
        tracing::info!(session = %self.session_id, "{}", report);
        Ok(report)
    }

    fn resume_counter(&self, counter: u64) {
        let mut current = self.counter.lock();
        *current = (*current).max(counter);
    }

    /// Validate everything a restore needs without touching any agent
    fn plan(
        &self,
        program: &ProgramCheckpoint,
        factory: &dyn AgentFactory,
    ) -> RestoreResult<Vec<PlannedAgent>> {
        let mut loaded: Vec<(String, Checkpoint)> = Vec::new();
        for (agent_id, indexed) in &program.agents {
            let missing = || RestoreError::MissingCheckpoint {
                agent: agent_id.clone(),
                checkpoint: indexed.to_string(),
            };
            let latest = self.store.latest(agent_id).map_err(|e| RestoreError::Corrupt {
                checkpoint: indexed.to_string(),
                detail: e.to_string(),
            })?;
            let id = latest.ok_or_else(missing)?;
            if id.counter() < indexed.counter() {
                return Err(missing());
            }
            let checkpoint = load_checkpoint(self.store.as_ref(), &id)
                .map_err(|e| RestoreError::Corrupt {
                    checkpoint: id.to_string(),
                    detail: e.to_string(),
                })?
                .ok_or_else(missing)?;
            if id != *indexed {
                tracing::debug!(agent = %agent_id, indexed = %indexed, latest = %id, "index is stale; using newest checkpoint");
            }
            loaded.push((agent_id.clone(), checkpoint));
        }

        let class_of = |agent_id: &str| -> Option<String> {
            loaded
                .iter()
                .find_map(|(_, checkpoint)| {
                    checkpoint
                        .execution_state
                        .peer_class(agent_id)
                        .map(str::to_string)
                })
                .or_else(|| {
                    program
                        .pending_agents
                        .iter()
                        .find(|peer| peer.id == agent_id)
                        .map(|peer| peer.class.clone())
                })
        };

        let mut plan = Vec::new();
        for (agent_id, checkpoint) in &loaded {
            let own_class = checkpoint
                .execution_state
                .peer_class(agent_id)
                .map(str::to_string);
            let live = self.registry.get(agent_id);
            let class = match (&live, own_class) {
                (Some(agent), Some(recorded)) if agent.class_name() != recorded => {
                    return Err(RestoreError::ClassMismatch {
                        agent: agent_id.clone(),
                        expected: recorded,
                        found: agent.class_name().to_string(),
                    });
                }
                (Some(agent), _) => agent.class_name().to_string(),
                (None, Some(recorded)) => recorded,
                (None, None) => class_of(agent_id)
                    .ok_or_else(|| RestoreError::UnresolvedClass(agent_id.clone()))?,
            };
            if !factory.has_class(&class) {
                return Err(RestoreError::UnknownClass {
                    agent: agent_id.clone(),
                    class,
                });
            }
            plan.push(PlannedAgent {
                id: agent_id.clone(),
                class,
                checkpoint: Some(checkpoint.clone()),
                live,
            });
        }

        for peer in &program.pending_agents {
            if program.agents.contains_key(&peer.id) {
                continue;
            }
            if !factory.has_class(&peer.class) {
                return Err(RestoreError::UnknownClass {
                    agent: peer.id.clone(),
                    class: peer.class.clone(),
                });
            }
            plan.push(PlannedAgent {
                id: peer.id.clone(),
                class: peer.class.clone(),
                checkpoint: None,
                live: self.registry.get(&peer.id),
            });
        }
        Ok(plan)
    }
}

impl CheckpointListener for ProgramCheckpointCoordinator {
    fn agent_checkpointed(&self, agent_id: &str, id: &CheckpointId) {
        if let Err(e) = self.save() {
            tracing::warn!(agent = agent_id, checkpoint = %id, error = %e, "program checkpoint failed");
        }
    }
}
