//! Error types for the encore runtime
//!
//! Each subsystem has its own `thiserror` enum and result alias; the
//! top-level [`RuntimeError`] converts from all of them at control boundaries.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Checkpoint encoding or bookkeeping errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Program restore errors
    #[error("Restore error: {0}")]
    Restore(#[from] RestoreError),

    /// Session registry and recovery errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Workflow loading errors
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Agent lifecycle errors
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Oracle errors
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// Execution id cannot be used as a directory name
    #[error("Execution id '{0}' is not filesystem safe")]
    UnsafeExecutionId(String),

    /// Blob exceeds the configured size limit
    #[error("Checkpoint {id} is {size} bytes, above the {limit} byte limit")]
    TooLarge {
        /// Checkpoint identifier
        id: String,
        /// Blob size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Config file error
    #[error("Config file error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Checkpoint-specific errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Identifier does not have the `{execution_id}_ckpt_{counter}` shape
    #[error("Invalid checkpoint id '{0}'")]
    InvalidId(String),

    /// Serialization failed
    #[error("Checkpoint encoding failed: {0}")]
    Encode(String),

    /// Deserialization failed
    #[error("Checkpoint decoding failed: {0}")]
    Decode(String),

    /// Underlying storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Convenience result alias for checkpoint operations
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

/// Restore errors. Any of these aborts the whole program restore.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// No program checkpoint exists for the session
    #[error("No program checkpoint found for session '{0}'")]
    NoProgramCheckpoint(String),

    /// An agent listed in the program checkpoint has no checkpoint of its own
    #[error("Agent {agent} has no checkpoint (program index references {checkpoint})")]
    MissingCheckpoint {
        /// Agent identifier
        agent: String,
        /// Checkpoint the program index pointed at
        checkpoint: String,
    },

    /// A checkpoint could not be read or decoded
    #[error("Checkpoint {checkpoint} is corrupt: {detail}")]
    Corrupt {
        /// Checkpoint identifier
        checkpoint: String,
        /// Failure description
        detail: String,
    },

    /// No peer list names the class of an agent that must be recreated
    #[error("Cannot determine the class of agent {0}")]
    UnresolvedClass(String),

    /// The recorded class is not defined by the loaded workflows
    #[error("Agent {agent} has unknown class '{class}'")]
    UnknownClass {
        /// Agent identifier
        agent: String,
        /// Class name
        class: String,
    },

    /// A live agent's class differs from the checkpointed one
    #[error("Agent {agent} is a {found}, but its checkpoint records a {expected}")]
    ClassMismatch {
        /// Agent identifier
        agent: String,
        /// Class recorded in checkpoints
        expected: String,
        /// Class of the live agent
        found: String,
    },

    /// Recreating an agent failed
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Checkpoint storage failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Convenience result alias for restore operations
pub type RestoreResult<T> = std::result::Result<T, RestoreError>;

/// Session registry and recovery state machine errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// A workflow path could not be resolved
    #[error("Cannot resolve workflow path {path}: {source}")]
    Resolve {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Invalid recovery phase transition
    #[error("Invalid recovery transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase
        from: String,
        /// Requested phase
        to: String,
    },

    /// Underlying storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Convenience result alias for session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Workflow loading errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Malformed workflow file
    #[error("{path}:{line}: {message}")]
    Parse {
        /// Source file
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// Description
        message: String,
    },

    /// The same class is defined twice
    #[error("Agent class '{0}' is defined more than once")]
    DuplicateClass(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for workflow operations
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

/// Agent lifecycle errors
#[derive(Debug, Error)]
pub enum AgentError {
    /// Class not present in the catalog
    #[error("Unknown agent class '{0}'")]
    UnknownClass(String),

    /// Agent not found in the registry
    #[error("Agent {0} not found")]
    NotFound(String),

    /// Id already taken by a live agent
    #[error("Agent id {0} is already in use")]
    DuplicateId(String),

    /// Workflow missing from the agent's class
    #[error("Agent class '{class}' has no workflow '{workflow}'")]
    UnknownWorkflow {
        /// Agent class
        class: String,
        /// Workflow name
        workflow: String,
    },

    /// The agent's checkpoint history could not be opened
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Convenience result alias for agent operations
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Oracle errors
#[derive(Debug, Error)]
pub enum OracleError {
    /// Script file could not be loaded
    #[error("Invalid oracle script: {0}")]
    Script(String),

    /// Streaming failed mid-turn
    #[error("Oracle stream failed: {0}")]
    Stream(String),
}

/// Convenience result alias for oracle operations
pub type OracleResult<T> = std::result::Result<T, OracleError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
