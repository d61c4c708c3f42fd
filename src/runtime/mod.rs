//! Runtime orchestration and durability
//!
//! Owns everything stateful: agents and their execution state, the message
//! bus, the oracle seam, and the checkpoint/recovery machinery that makes a
//! whole multi-agent program resumable after the process is killed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// Submodules
pub mod agent;
pub mod bus;
pub mod checkpoint;
pub mod error;
pub mod host;
pub mod oracle;
pub mod program;
pub mod program_checkpoint;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod state;
pub mod storage;
pub mod workflow;

pub use agent::{Agent, StartMode};
pub use bus::{Message, MessageBus, TranscriptEntry, TranscriptKind};
pub use checkpoint::{AgentCheckpointCoordinator, Checkpoint, CheckpointId, CheckpointMetadata};
pub use oracle::{Oracle, OracleRequest, ScriptedOracle};
pub use program::{Program, ProgramReport, StartReport};
pub use program_checkpoint::{ProgramCheckpoint, ProgramCheckpointCoordinator, RestoreReport};
pub use recovery::{RecoveryCoordinator, RecoveryPhase, ResumeRequest};
pub use registry::{AgentCatalog, AgentClass, AgentRegistry};
pub use session::SessionRegistry;
pub use state::{
    CallStack, CallStackFrame, ExecutionState, InstructionPointer, ParkedTurn, PeerDescriptor,
};
pub use storage::{CheckpointStore, FilesystemCheckpointStore, MemoryCheckpointStore};
pub use workflow::WorkflowSet;

/// Blob encoding used for checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Pretty JSON, human inspectable
    #[default]
    Json,
    /// Preserves packed binary
    Preserves,
}

/// Configuration for the encore runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for runtime storage (default: .encore/)
    pub root: PathBuf,

    /// Checkpoints kept per execution id; 0 keeps everything
    pub keep_last: usize,

    /// Largest checkpoint blob accepted by the store
    pub max_checkpoint_bytes: usize,

    /// Encoding for new checkpoint blobs
    pub codec: Codec,

    /// Oracle turns a single call-stack frame may take before it is abandoned
    pub max_turns_per_frame: usize,

    /// Corrective turns granted after statement errors, per frame
    pub max_statement_retries: usize,

    /// Awaits one statement may complete before a missing-checkpoint warning
    pub unchecked_suspend_warning: usize,

    /// Close the bus once every agent is blocked and no message is in flight
    pub shutdown_when_idle: bool,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".encore"),
            keep_last: 20,
            max_checkpoint_bytes: 16 * 1024 * 1024,
            codec: Codec::Json,
            max_turns_per_frame: 16,
            max_statement_retries: 2,
            unchecked_suspend_warning: 8,
            shutdown_when_idle: true,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted at `root` with default settings
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Base directory of all checkpoint stores (holds `.sessions.json`)
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    /// Checkpoint store directory of one session
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.checkpoints_dir().join(session_id)
    }
}
