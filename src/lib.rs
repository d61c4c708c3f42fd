//! Encore – a resumable multi-agent playbook runtime
//!
//! Agents follow natural-language workflows, one oracle turn at a time. Each
//! turn arrives as a stream of generated statements which is executed
//! incrementally while it is still being produced. The runtime provides:
//! - Streaming statement execution with safe-prefix detection
//! - A per-agent call stack of workflow frames and instruction pointers
//! - Durable agent checkpoints at every suspension point and frame boundary
//! - Program-level checkpoints that make a whole session resumable after a kill
//! - A message bus with idle detection and a human-facing transcript

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Statement language: parsing, evaluation, and incremental execution
pub mod interpreter;

/// Agents, message bus, checkpoints, and recovery
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{Program, ResumeRequest, RuntimeConfig};

/// Current version of the Encore runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
