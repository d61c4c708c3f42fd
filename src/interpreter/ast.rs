use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::value::Value;

/// Binary operators supported by the statement language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `//`
    FloorDiv,
    /// `%`
    Mod,
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtE,
    /// `>`
    Gt,
    /// `>=`
    GtE,
    /// `in`
    In,
    /// `not in`
    NotIn,
}

impl BinaryOp {
    /// Operator symbol, used in diagnostics.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtE => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtE => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Logical negation.
    Not,
}

/// Short-circuit boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOp {
    /// `and`
    And,
    /// `or`
    Or,
}

/// Piece of an f-string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FStringPart {
    /// Literal text.
    Text(String),
    /// Interpolated expression.
    Expr(Expr),
}

/// Expression nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Literal constant.
    Literal(Value),
    /// Formatted string literal.
    FString(Vec<FStringPart>),
    /// Local (namespace) variable.
    Name(String),
    /// Agent-level variable written as `$name`.
    StateVar(String),
    /// List display.
    List(Vec<Expr>),
    /// Dict display.
    Dict(Vec<(Expr, Expr)>),
    /// Subscript `value[index]`.
    Index {
        /// Indexed value.
        value: Box<Expr>,
        /// Index expression.
        index: Box<Expr>,
    },
    /// Function call.
    Call(Call),
    /// Method call `receiver.method(args)`.
    Method {
        /// Receiver expression.
        receiver: Box<Expr>,
        /// Method name.
        method: String,
        /// Positional arguments.
        args: Vec<Expr>,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Short-circuit boolean operation.
    BoolOp {
        /// Operator.
        op: BoolOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
}

/// A call to a named function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Function name.
    pub function: String,
    /// Positional arguments.
    pub args: Vec<Expr>,
    /// Keyword arguments in source order.
    pub kwargs: Vec<(String, Expr)>,
}

/// Assignment target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// Local variable.
    Name(String),
    /// Agent-level variable.
    StateVar(String),
    /// Item assignment `container[index] = ...` on a named container.
    Index {
        /// Container (a local or agent-level variable).
        container: Box<Target>,
        /// Index expression.
        index: Expr,
    },
}

/// Statement nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Expression evaluated for its side effects.
    Expr(Expr),
    /// `target = value`
    Assign {
        /// Assignment target.
        target: Target,
        /// Assigned value.
        value: Expr,
    },
    /// `target op= value`
    AugAssign {
        /// Assignment target.
        target: Target,
        /// Arithmetic operator.
        op: BinaryOp,
        /// Right-hand side.
        value: Expr,
    },
    /// `[target =] await Call(...)`: the only form that can suspend.
    Await {
        /// Optional binding for the call result.
        target: Option<Target>,
        /// Awaited host call.
        call: Call,
    },
    /// `if/elif/else` chain.
    If {
        /// Conditions with their bodies, in order.
        branches: Vec<(Expr, Vec<Stmt>)>,
        /// `else` body (possibly empty).
        orelse: Vec<Stmt>,
    },
    /// `while cond:` loop.
    While {
        /// Loop condition.
        condition: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `for var in iter:` loop.
    For {
        /// Loop variable.
        var: String,
        /// Iterated expression.
        iter: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `pass`
    Pass,
}

impl Stmt {
    /// Whether the statement introduces an indented body.
    pub fn is_compound(&self) -> bool {
        matches!(self, Stmt::If { .. } | Stmt::While { .. } | Stmt::For { .. })
    }

    /// Whether executing the statement may suspend on an external result.
    pub fn contains_await(&self) -> bool {
        match self {
            Stmt::Await { .. } => true,
            Stmt::If { branches, orelse } => {
                branches
                    .iter()
                    .any(|(_, body)| body.iter().any(Stmt::contains_await))
                    || orelse.iter().any(Stmt::contains_await)
            }
            Stmt::While { body, .. } | Stmt::For { body, .. } => {
                body.iter().any(Stmt::contains_await)
            }
            _ => false,
        }
    }
}

/// A top-level statement together with the byte range of source lines it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatement {
    /// Parsed statement.
    pub stmt: Stmt,
    /// Byte range within the parsed source, ending after the statement's last newline.
    pub span: Range<usize>,
}

impl ParsedStatement {
    /// Slice of the source this statement was parsed from.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.span.clone()]
    }
}
