//! Statement execution against a host.
//!
//! Everything with an effect outside the local namespace goes through
//! [`StatementHost`]: agent-level variables, awaited operations, and the
//! checkpoint request raised after a suspend point.

use std::collections::BTreeMap;

use futures::future::BoxFuture;

use super::ExecError;
use super::ast::{Call, Expr, Stmt, Target};
use super::eval::{
    MUTATING_METHODS, Scope, binary_op, call_mutating_method, dict_key, eval_args, eval_expr,
    index_value, is_builtin, iterate, resolve_index,
};
use super::value::{Namespace, Value};

/// Upper bound on `while` iterations within one statement.
pub const MAX_LOOP_ITERATIONS: usize = 10_000;

/// An awaited operation handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCall {
    /// Operation name, e.g. `Say`.
    pub function: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: BTreeMap<String, Value>,
}

impl HostCall {
    /// Positional argument or keyword argument by name.
    pub fn arg(&self, position: usize, name: &str) -> Option<&Value> {
        self.args.get(position).or_else(|| self.kwargs.get(name))
    }
}

/// State captured right after a suspend point completed.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendPoint {
    /// Source text of the statement that suspended.
    pub statement: String,
    /// Local namespace after the statement.
    pub namespace: Namespace,
    /// Everything the oracle produced for this turn so far.
    pub oracle_output: String,
    /// Prefix of `oracle_output` that has been executed.
    pub executed_prefix: String,
    /// Awaits completed while executing the statement (more than one for loops).
    pub nested_suspends: usize,
}

/// The turn as it stands just before a statement that may await.
#[derive(Debug, Clone, Copy)]
pub struct StatementStart<'a> {
    /// Source text of the statement about to run.
    pub statement: &'a str,
    /// Local namespace before the statement.
    pub namespace: &'a Namespace,
    /// Everything the oracle produced for this turn so far.
    pub oracle_output: &'a str,
    /// Prefix of `oracle_output` executed before the statement.
    pub executed_prefix: &'a str,
}

/// Side-effect interface used by generated statements.
pub trait StatementHost: Send {
    /// Whether `name` is an awaitable host operation.
    fn is_host_function(&self, name: &str) -> bool;

    /// Perform an awaited operation.
    fn call(&mut self, call: HostCall) -> BoxFuture<'_, Result<Value, ExecError>>;

    /// Read an agent-level variable.
    fn get_variable(&self, name: &str) -> Option<Value>;

    /// Write an agent-level variable.
    fn set_variable(&mut self, name: &str, value: Value);

    /// A suspend point completed; persist it before execution continues.
    fn suspended(&mut self, point: SuspendPoint);

    /// A statement that may await is about to run.
    fn statement_started(&mut self, _start: StatementStart<'_>) {}

    /// Whether the last operation ended the turn (`Return`, `Yield`).
    fn halted(&self) -> bool {
        false
    }
}

/// Result of executing one top-level statement.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementOutcome {
    /// Error raised by the statement, if any.
    pub result: Result<(), ExecError>,
    /// Awaited operations that completed, including ones before an error.
    pub awaits: usize,
    /// The host asked to stop executing this turn.
    pub halted: bool,
}

/// Execute a top-level statement.
pub async fn execute_statement<H: StatementHost>(
    stmt: &Stmt,
    namespace: &mut Namespace,
    host: &mut H,
) -> StatementOutcome {
    let mut runner = Runner {
        host,
        ns: namespace,
        awaits: 0,
    };
    let flow = runner.exec_stmt(stmt).await;
    let awaits = runner.awaits;
    let (result, halted) = match flow {
        Ok(Flow::Normal) => (Ok(()), false),
        Ok(Flow::Halt) => (Ok(()), true),
        Ok(Flow::Break) => (Err(ExecError::ControlOutsideLoop("break")), false),
        Ok(Flow::Continue) => (Err(ExecError::ControlOutsideLoop("continue")), false),
        Err(err) => (Err(err), false),
    };
    StatementOutcome {
        result,
        awaits,
        halted,
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Halt,
}

struct Runner<'a, H> {
    host: &'a mut H,
    ns: &'a mut Namespace,
    awaits: usize,
}

struct View<'v, H> {
    ns: &'v Namespace,
    host: &'v H,
}

impl<H: StatementHost> Scope for View<'_, H> {
    fn namespace(&self) -> &Namespace {
        self.ns
    }

    fn state_var(&self, name: &str) -> Option<Value> {
        self.host.get_variable(name)
    }

    fn is_host_function(&self, name: &str) -> bool {
        self.host.is_host_function(name)
    }
}

impl<H: StatementHost> Runner<'_, H> {
    fn view(&self) -> View<'_, H> {
        View {
            ns: &*self.ns,
            host: &*self.host,
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ExecError> {
        eval_expr(expr, &self.view())
    }

    fn exec_block<'b>(&'b mut self, body: &'b [Stmt]) -> BoxFuture<'b, Result<Flow, ExecError>> {
        Box::pin(async move {
            for stmt in body {
                match self.exec_stmt(stmt).await? {
                    Flow::Normal => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal)
        })
    }

    fn exec_stmt<'b>(&'b mut self, stmt: &'b Stmt) -> BoxFuture<'b, Result<Flow, ExecError>> {
        Box::pin(async move {
            match stmt {
                Stmt::Pass => Ok(Flow::Normal),
                Stmt::Break => Ok(Flow::Break),
                Stmt::Continue => Ok(Flow::Continue),
                Stmt::Expr(expr) => {
                    self.eval_value(expr)?;
                    Ok(Flow::Normal)
                }
                Stmt::Assign { target, value } => {
                    let value = self.eval_value(value)?;
                    self.assign(target, value)?;
                    Ok(Flow::Normal)
                }
                Stmt::AugAssign { target, op, value } => {
                    let rhs = self.eval_value(value)?;
                    let current = self.read_target(target)?;
                    let updated = binary_op(*op, &current, &rhs)?;
                    self.assign(target, updated)?;
                    Ok(Flow::Normal)
                }
                Stmt::Await { target, call } => {
                    let host_call = self.prepare_host_call(call)?;
                    tracing::debug!(function = %host_call.function, "awaiting host operation");
                    let result = self.host.call(host_call).await?;
                    self.awaits += 1;
                    if let Some(target) = target {
                        self.assign(target, result)?;
                    }
                    if self.host.halted() {
                        return Ok(Flow::Halt);
                    }
                    Ok(Flow::Normal)
                }
                Stmt::If { branches, orelse } => {
                    for (condition, body) in branches {
                        if self.eval(condition)?.is_truthy() {
                            return self.exec_block(body).await;
                        }
                    }
                    self.exec_block(orelse).await
                }
                Stmt::While { condition, body } => {
                    let mut iterations = 0;
                    while self.eval(condition)?.is_truthy() {
                        iterations += 1;
                        if iterations > MAX_LOOP_ITERATIONS {
                            return Err(ExecError::IterationLimit(MAX_LOOP_ITERATIONS));
                        }
                        match self.exec_block(body).await? {
                            Flow::Break => break,
                            Flow::Halt => return Ok(Flow::Halt),
                            Flow::Normal | Flow::Continue => {}
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::For { var, iter, body } => {
                    let items = iterate(&self.eval(iter)?)?;
                    for item in items {
                        self.ns.set(var.clone(), item);
                        match self.exec_block(body).await? {
                            Flow::Break => break,
                            Flow::Halt => return Ok(Flow::Halt),
                            Flow::Normal | Flow::Continue => {}
                        }
                    }
                    Ok(Flow::Normal)
                }
            }
        })
    }

    fn prepare_host_call(&self, call: &Call) -> Result<HostCall, ExecError> {
        if !self.host.is_host_function(&call.function) {
            if is_builtin(&call.function) {
                return Err(ExecError::NotAwaitable(call.function.clone()));
            }
            return Err(ExecError::UnknownFunction(call.function.clone()));
        }
        let (args, kwargs) = eval_args(call, &self.view())?;
        Ok(HostCall {
            function: call.function.clone(),
            args,
            kwargs,
        })
    }

    /// Evaluate a statement-level value, allowing in-place container methods.
    fn eval_value(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        if let Expr::Method {
            receiver,
            method,
            args,
        } = expr
        {
            if MUTATING_METHODS.contains(&method.as_str()) {
                let target = expr_as_target(receiver, &self.view())?.ok_or_else(|| {
                    ExecError::Type(format!(
                        "`.{}()` needs a variable as its receiver",
                        method
                    ))
                })?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut container = self.read_target(&target)?;
                let result = call_mutating_method(&mut container, method, args)?;
                self.assign(&target, container)?;
                return Ok(result);
            }
        }
        self.eval(expr)
    }

    fn read_target(&self, target: &Target) -> Result<Value, ExecError> {
        match target {
            Target::Name(name) => self
                .ns
                .get(name)
                .cloned()
                .ok_or_else(|| ExecError::UndefinedVariable(name.clone())),
            Target::StateVar(name) => self
                .host
                .get_variable(name)
                .ok_or_else(|| ExecError::UndefinedVariable(format!("${}", name))),
            Target::Index { container, index } => {
                let container = self.read_target(container)?;
                let index = self.eval(index)?;
                index_value(&container, &index)
            }
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), ExecError> {
        match target {
            Target::Name(name) => {
                self.ns.set(name.clone(), value);
                Ok(())
            }
            Target::StateVar(name) => {
                self.host.set_variable(name, value);
                Ok(())
            }
            Target::Index { container, index } => {
                let index = self.eval(index)?;
                let mut current = self.read_target(container)?;
                set_item(&mut current, index, value)?;
                self.assign(container, current)
            }
        }
    }
}

fn set_item(container: &mut Value, index: Value, value: Value) -> Result<(), ExecError> {
    match container {
        Value::List(items) => {
            let idx = resolve_index(items.len(), &index)?;
            items[idx] = value;
            Ok(())
        }
        Value::Dict(map) => {
            map.insert(dict_key(index)?, value);
            Ok(())
        }
        other => Err(ExecError::Type(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Reinterpret a method receiver as an assignable location.
fn expr_as_target(expr: &Expr, scope: &dyn Scope) -> Result<Option<Target>, ExecError> {
    Ok(match expr {
        Expr::Name(name) => Some(Target::Name(name.clone())),
        Expr::StateVar(name) => Some(Target::StateVar(name.clone())),
        Expr::Index { value, index } => match expr_as_target(value, scope)? {
            Some(container) => {
                // Pin the index so side effects of re-evaluation cannot move it.
                let index = eval_expr(index, scope)?;
                Some(Target::Index {
                    container: Box::new(container),
                    index: Expr::Literal(index),
                })
            }
            None => None,
        },
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::parser::parse_statements;

    #[derive(Default)]
    struct RecordingHost {
        said: Vec<String>,
        vars: BTreeMap<String, Value>,
        halted: bool,
        suspends: Vec<SuspendPoint>,
    }

    impl StatementHost for RecordingHost {
        fn is_host_function(&self, name: &str) -> bool {
            matches!(name, "Say" | "Return")
        }

        fn call(&mut self, call: HostCall) -> BoxFuture<'_, Result<Value, ExecError>> {
            Box::pin(async move {
                match call.function.as_str() {
                    "Say" => {
                        let text = call.arg(0, "text").cloned().unwrap_or(Value::None);
                        self.said.push(text.to_string());
                        Ok(Value::None)
                    }
                    _ => {
                        self.halted = true;
                        Ok(call.args.first().cloned().unwrap_or(Value::None))
                    }
                }
            })
        }

        fn get_variable(&self, name: &str) -> Option<Value> {
            self.vars.get(name).cloned()
        }

        fn set_variable(&mut self, name: &str, value: Value) {
            self.vars.insert(name.to_string(), value);
        }

        fn suspended(&mut self, point: SuspendPoint) {
            self.suspends.push(point);
        }

        fn halted(&self) -> bool {
            self.halted
        }
    }

    async fn run(src: &str, ns: &mut Namespace, host: &mut RecordingHost) -> Vec<StatementOutcome> {
        let mut outcomes = Vec::new();
        for parsed in parse_statements(src).expect("parse") {
            outcomes.push(execute_statement(&parsed.stmt, ns, host).await);
        }
        outcomes
    }

    #[tokio::test]
    async fn loops_count_nested_awaits() {
        let mut ns = Namespace::new();
        let mut host = RecordingHost::default();
        let outcomes = run(
            "for name in ['a', 'b', 'c']:\n    if name == 'b':\n        continue\n    await Say(name)\n",
            &mut ns,
            &mut host,
        )
        .await;
        assert_eq!(outcomes[0].result, Ok(()));
        assert_eq!(outcomes[0].awaits, 2);
        assert_eq!(host.said, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn state_variables_live_on_the_host() {
        let mut ns = Namespace::new();
        let mut host = RecordingHost::default();
        run("$total = 1\n$total += 4\ncopy = $total\n", &mut ns, &mut host).await;
        assert_eq!(host.vars.get("total"), Some(&Value::Int(5)));
        assert_eq!(ns.get("copy"), Some(&Value::Int(5)));
    }

    #[tokio::test]
    async fn container_mutation_writes_back() {
        let mut ns = Namespace::new();
        let mut host = RecordingHost::default();
        let src = "items = []\nitems.append(1)\nbook = {'a': [1]}\nbook['a'].append(2)\nbook['b'] = items.pop()\n";
        let outcomes = run(src, &mut ns, &mut host).await;
        assert!(outcomes.iter().all(|outcome| outcome.result.is_ok()));
        assert_eq!(ns.get("items"), Some(&Value::List(vec![])));
        assert_eq!(
            ns.get("book").map(Value::to_string).as_deref(),
            Some("{'a': [1, 2], 'b': 1}")
        );
    }

    #[tokio::test]
    async fn return_halts_inside_loop() {
        let mut ns = Namespace::new();
        let mut host = RecordingHost::default();
        let outcomes = run(
            "while True:\n    result = await Return(3)\n    await Say('unreachable')\n",
            &mut ns,
            &mut host,
        )
        .await;
        assert!(outcomes[0].halted);
        assert_eq!(ns.get("result"), Some(&Value::Int(3)));
        assert!(host.said.is_empty());
    }

    #[tokio::test]
    async fn awaiting_builtins_and_unknown_functions_fails() {
        let mut ns = Namespace::new();
        let mut host = RecordingHost::default();
        let outcomes = run("await len([])\nawait Fly()\nbreak\n", &mut ns, &mut host).await;
        assert_eq!(outcomes[0].result, Err(ExecError::NotAwaitable("len".into())));
        assert_eq!(outcomes[1].result, Err(ExecError::UnknownFunction("Fly".into())));
        assert_eq!(outcomes[2].result, Err(ExecError::ControlOutsideLoop("break")));
    }

    #[tokio::test]
    async fn runaway_while_is_stopped() {
        let mut ns = Namespace::new();
        let mut host = RecordingHost::default();
        let outcomes = run("n = 0\nwhile True:\n    n += 1\n", &mut ns, &mut host).await;
        assert_eq!(
            outcomes[1].result,
            Err(ExecError::IterationLimit(MAX_LOOP_ITERATIONS))
        );
    }
}
