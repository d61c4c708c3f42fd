//! Statement language executed on behalf of the oracle.
//!
//! The oracle answers each turn with a short burst of Python-flavoured
//! statements. This module tokenizes and parses them, evaluates expressions,
//! runs statements against a [`StatementHost`] that owns every side effect, and
//! drives all of it incrementally from a growing text stream via
//! [`IncrementalStatementExecutor`].

/// Abstract syntax tree for generated statements.
pub mod ast;
/// Safe-prefix detection over a partially received stream.
pub mod boundary;
/// Expression evaluation and builtin functions.
pub mod eval;
/// Statement execution and the host interface.
pub mod exec;
/// Indentation-aware tokenizer.
pub mod lexer;
/// Recursive-descent parser.
pub mod parser;
/// Incremental executor fed by the oracle stream.
pub mod streaming;
/// Runtime values and the local namespace.
pub mod value;

pub use ast::{Call, Expr, ParsedStatement, Stmt, Target};
pub use boundary::{SafeCut, find_safe_prefix};
pub use exec::{
    HostCall, StatementHost, StatementOutcome, StatementStart, SuspendPoint, execute_statement,
};
pub use parser::{parse_expression, parse_statements};
pub use streaming::{FeedReport, IncrementalStatementExecutor, Leftover, StatementFailure};
pub use value::{Namespace, Value};

use std::fmt;
use thiserror::Error;

/// Parse failure with the 1-based line it was detected on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error on line {line}: {message}")]
pub struct SyntaxError {
    /// Line number (1-based, relative to the parsed text).
    pub line: usize,
    /// Human-readable description.
    pub message: String,
}

impl SyntaxError {
    /// Construct a syntax error.
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Errors raised while executing a generated statement.
///
/// These are never fatal to a run: the executor records them and the agent
/// hands them back to the oracle as corrective context.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    /// A local or agent-level variable was read before assignment.
    #[error("variable `{0}` was read before it was assigned")]
    UndefinedVariable(String),

    /// Operation applied to values of the wrong type.
    #[error("type error: {0}")]
    Type(String),

    /// Division or modulo by zero.
    #[error("division by zero")]
    ZeroDivision,

    /// List index or dict key missing.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// Call to a function that is neither a builtin nor a host operation.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    /// Host operation invoked without `await`.
    #[error("`{0}` is an operation that must be awaited: write `await {0}(...)`")]
    MustAwait(String),

    /// Builtin invoked with an awaited call.
    #[error("`{0}` is a builtin and cannot be awaited")]
    NotAwaitable(String),

    /// `break`/`continue` outside a loop.
    #[error("`{0}` outside loop")]
    ControlOutsideLoop(&'static str),

    /// Host operation failed.
    #[error("{function} failed: {message}")]
    Host {
        /// Host operation name.
        function: String,
        /// Failure description.
        message: String,
    },

    /// Runaway `while` loop.
    #[error("loop exceeded {0} iterations")]
    IterationLimit(usize),
}

impl ExecError {
    /// Whether this error is the "read before assignment" diagnostic.
    pub fn is_undefined_variable(&self) -> bool {
        matches!(self, ExecError::UndefinedVariable(_))
    }
}

/// Which kind of failure a generated statement produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The statement could not be parsed.
    Syntax,
    /// A variable was read before it was assigned.
    UndefinedVariable,
    /// Any other runtime failure.
    Runtime,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Syntax => write!(f, "SyntaxError"),
            FailureKind::UndefinedVariable => write!(f, "NameError"),
            FailureKind::Runtime => write!(f, "RuntimeError"),
        }
    }
}
