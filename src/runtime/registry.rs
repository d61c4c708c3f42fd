//! Agent class catalog and the live agent registry
//!
//! The catalog is a factory table keyed by class name, built once from the
//! loaded workflows. The registry is owned by a program and handed to every
//! agent task; nothing here is global.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::agent::Agent;
use super::error::{AgentError, AgentResult};
use super::state::PeerDescriptor;
use super::workflow::WorkflowSet;

/// First id handed out by [`AgentRegistry::allocate_id`]
pub const FIRST_AGENT_ID: u64 = 1000;

/// Everything needed to instantiate an agent of one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentClass {
    /// Class name
    pub name: String,
    /// Description used for the begin-of-life introduction
    pub description: String,
    /// Workflow entered by a fresh agent
    pub entry_workflow: Option<String>,
    /// Workflow entered for each incoming message
    pub message_workflow: Option<String>,
    /// Instantiated when the program starts
    pub startup: bool,
}

/// Factory table of agent classes
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    classes: BTreeMap<String, Arc<AgentClass>>,
}

impl AgentCatalog {
    /// Build the catalog from a workflow graph
    pub fn from_workflows(workflows: &WorkflowSet) -> Self {
        let classes = workflows
            .classes()
            .map(|def| {
                let class = AgentClass {
                    name: def.name.clone(),
                    description: def.description.clone(),
                    entry_workflow: def.entry_workflow().map(|wf| wf.name.clone()),
                    message_workflow: def.message_workflow().map(|wf| wf.name.clone()),
                    startup: def.startup,
                };
                (def.name.clone(), Arc::new(class))
            })
            .collect();
        Self { classes }
    }

    /// Look up a class
    pub fn get(&self, name: &str) -> AgentResult<Arc<AgentClass>> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownClass(name.to_string()))
    }

    /// Whether the class exists
    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// Classes instantiated at program start, in name order
    pub fn startup_classes(&self) -> Vec<Arc<AgentClass>> {
        self.classes
            .values()
            .filter(|class| class.startup)
            .cloned()
            .collect()
    }

    /// Number of classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Live agents of one program, keyed by id
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Arc<Agent>>>,
    next_id: Mutex<u64>,
}

impl AgentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            next_id: Mutex::new(FIRST_AGENT_ID),
        }
    }

    /// Reserve a fresh agent id
    pub fn allocate_id(&self) -> String {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        id.to_string()
    }

    /// Register an agent whose id came from [`allocate_id`](Self::allocate_id)
    pub fn insert(&self, agent: Arc<Agent>) -> AgentResult<()> {
        let mut agents = self.agents.write();
        if agents.contains_key(agent.id()) {
            return Err(AgentError::DuplicateId(agent.id().to_string()));
        }
        agents.insert(agent.id().to_string(), agent);
        Ok(())
    }

    /// Register an agent that keeps an id chosen elsewhere (restore).
    ///
    /// The allocator moves past numeric ids so later allocations never
    /// collide with a restored identity.
    pub fn insert_with_id(&self, agent: Arc<Agent>) -> AgentResult<()> {
        if let Ok(numeric) = agent.id().parse::<u64>() {
            let mut next = self.next_id.lock();
            *next = (*next).max(numeric + 1);
        }
        self.insert(agent)
    }

    /// Agent by id
    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.read().get(id).cloned()
    }

    /// Remove an agent
    pub fn remove(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.write().remove(id)
    }

    /// All agents in id order
    pub fn list(&self) -> Vec<Arc<Agent>> {
        self.agents.read().values().cloned().collect()
    }

    /// `Class(agent id)` descriptors of all live agents
    pub fn descriptors(&self) -> Vec<PeerDescriptor> {
        self.agents
            .read()
            .values()
            .map(|agent| agent.descriptor())
            .collect()
    }

    /// Number of live agents
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// Whether no agent is live
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Codec;
    use crate::runtime::checkpoint::AgentCheckpointCoordinator;
    use crate::runtime::storage::{CheckpointStore, MemoryCheckpointStore};

    fn catalog() -> AgentCatalog {
        let workflows = WorkflowSet::from_source(
            "# Buyer\nBuys.\n## Main\ntrigger: begin\n- 01: Buy\n# Seller\nstartup: no\n## Handle\ntrigger: message\n- 01: Sell\n",
        )
        .unwrap();
        AgentCatalog::from_workflows(&workflows)
    }

    fn agent(id: &str, class: Arc<AgentClass>) -> Arc<Agent> {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let checkpoints = AgentCheckpointCoordinator::new(id, store, Codec::Json).unwrap();
        Arc::new(Agent::new(id, class, checkpoints))
    }

    #[test]
    fn catalog_exposes_workflow_roles() {
        let catalog = catalog();
        let buyer = catalog.get("Buyer").unwrap();
        assert_eq!(buyer.entry_workflow.as_deref(), Some("Main"));
        assert_eq!(buyer.message_workflow, None);
        let seller = catalog.get("Seller").unwrap();
        assert_eq!(seller.message_workflow.as_deref(), Some("Handle"));
        assert_eq!(catalog.startup_classes().len(), 1);
        assert!(matches!(catalog.get("Nobody"), Err(AgentError::UnknownClass(_))));
    }

    #[test]
    fn restored_ids_bump_the_allocator() {
        let catalog = catalog();
        let registry = AgentRegistry::new();
        assert_eq!(registry.allocate_id(), "1000");

        registry
            .insert_with_id(agent("1004", catalog.get("Seller").unwrap()))
            .unwrap();
        assert_eq!(registry.allocate_id(), "1005");

        let err = registry
            .insert(agent("1004", catalog.get("Buyer").unwrap()))
            .unwrap_err();
        assert!(matches!(err, AgentError::DuplicateId(id) if id == "1004"));
        assert_eq!(
            registry.descriptors(),
            vec![PeerDescriptor::new("1004", "Seller")]
        );
        assert!(registry.remove("1004").is_some());
        assert!(registry.is_empty());
    }
}
