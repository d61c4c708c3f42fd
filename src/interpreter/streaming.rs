//! Incremental execution of a streamed oracle turn.

use std::fmt;

use super::ast::ParsedStatement;
use super::boundary::find_safe_prefix;
use super::exec::{StatementHost, StatementStart, SuspendPoint, execute_statement};
use super::parser::parse_statements;
use super::value::Namespace;
use super::{FailureKind, SyntaxError};

/// Default number of awaits one statement may complete before a warning.
pub const DEFAULT_UNCHECKED_SUSPEND_WARNING: usize = 8;

/// A generated statement that failed to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Statement source text.
    pub statement: String,
    /// Diagnostic.
    pub message: String,
}

impl fmt::Display for StatementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in `{}`: {}", self.kind, self.statement, self.message)
    }
}

/// Text left over at the end of a turn that never formed a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Leftover {
    /// Unexecuted text.
    pub text: String,
    /// Why it did not parse.
    pub error: SyntaxError,
}

/// What one `feed`/`finish` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedReport {
    /// Statements executed.
    pub executed: usize,
    /// Suspend points reported to the host.
    pub suspends: usize,
    /// Statements that raised an error.
    pub failures: usize,
    /// The host halted the turn.
    pub halted: bool,
    /// Unparseable trailing text (only produced by `finish`).
    pub leftover: Option<Leftover>,
}

/// Turns a growing oracle stream into executed statements.
///
/// Text is buffered until a prefix of complete statements is available; that
/// prefix runs against a namespace that persists for the whole turn. Every
/// statement that completed an await is a suspend point and is reported to
/// the host before the next statement runs.
pub struct IncrementalStatementExecutor<H> {
    host: H,
    namespace: Namespace,
    output: String,
    consumed: usize,
    errors: Vec<StatementFailure>,
    halted: bool,
    suspend_warning: usize,
}

impl<H: StatementHost> IncrementalStatementExecutor<H> {
    /// Create an executor with an empty namespace.
    pub fn new(host: H) -> Self {
        Self::with_namespace(host, Namespace::new())
    }

    /// Create an executor over an existing namespace.
    pub fn with_namespace(host: H, namespace: Namespace) -> Self {
        Self {
            host,
            namespace,
            output: String::new(),
            consumed: 0,
            errors: Vec::new(),
            halted: false,
            suspend_warning: DEFAULT_UNCHECKED_SUSPEND_WARNING,
        }
    }

    /// Warn when one statement completes more than `threshold` awaits.
    pub fn with_suspend_warning(mut self, threshold: usize) -> Self {
        self.suspend_warning = threshold;
        self
    }

    /// Rebuild an executor from a checkpointed turn and run what was left.
    ///
    /// The namespace is restored and the part of `oracle_output` after
    /// `executed_prefix` is fed again. If the prefix does not match the output
    /// verbatim the whole output is replayed.
    pub async fn resume(
        host: H,
        namespace: Namespace,
        oracle_output: &str,
        executed_prefix: &str,
    ) -> Self {
        let mut executor = Self::with_namespace(host, namespace);
        executor.continue_turn(oracle_output, executed_prefix).await;
        executor
    }

    /// Like [`resume`](Self::resume), for an executor that was already
    /// configured. Must be called before anything else was fed.
    pub async fn continue_turn(&mut self, oracle_output: &str, executed_prefix: &str) -> FeedReport {
        let remaining = match oracle_output.strip_prefix(executed_prefix) {
            Some(remaining) => {
                self.output.push_str(executed_prefix);
                self.consumed = executed_prefix.len();
                remaining
            }
            None => {
                tracing::warn!(
                    prefix_len = executed_prefix.len(),
                    output_len = oracle_output.len(),
                    "executed prefix does not match checkpointed output; replaying the whole turn"
                );
                oracle_output
            }
        };
        tracing::debug!(remaining = remaining.len(), "resuming checkpointed turn");
        self.feed(remaining).await
    }

    /// Append a chunk of oracle output and execute whatever became complete.
    pub async fn feed(&mut self, chunk: &str) -> FeedReport {
        if self.halted {
            return FeedReport {
                halted: true,
                ..FeedReport::default()
            };
        }
        self.output.push_str(chunk);

        let mut report = FeedReport::default();
        let pending = &self.output[self.consumed..];
        if let Some(cut) = find_safe_prefix(pending) {
            let base = self.consumed;
            let source = pending[..cut.end].to_string();
            self.run(base, &source, cut.statements, &mut report).await;
        }
        report
    }

    /// The oracle turn ended: execute everything that still parses.
    pub async fn finish(&mut self) -> FeedReport {
        let mut report = FeedReport::default();
        if self.halted {
            report.halted = true;
            return report;
        }

        let mut pending = self.output[self.consumed..].to_string();
        if pending.trim().is_empty() {
            self.consumed = self.output.len();
            return report;
        }
        if !pending.ends_with('\n') {
            pending.push('\n');
        }

        let base = self.consumed;
        match parse_statements(&pending) {
            Ok(statements) => self.run(base, &pending, statements, &mut report).await,
            Err(error) => {
                let executed_to = match find_safe_prefix(&pending) {
                    Some(cut) => {
                        let source = pending[..cut.end].to_string();
                        self.run(base, &source, cut.statements, &mut report).await;
                        cut.end
                    }
                    None => 0,
                };
                if !report.halted {
                    let text = pending[executed_to..].trim_end().to_string();
                    tracing::debug!(%error, leftover = %text, "turn ended with unparseable text");
                    report.leftover = Some(Leftover { text, error });
                }
            }
        }
        if !self.halted {
            self.consumed = self.output.len();
        }
        report
    }

    async fn run(
        &mut self,
        base: usize,
        source: &str,
        statements: Vec<ParsedStatement>,
        report: &mut FeedReport,
    ) {
        for parsed in statements {
            let text = parsed.text(source).trim_end().to_string();
            if parsed.stmt.contains_await() {
                self.host.statement_started(StatementStart {
                    statement: &text,
                    namespace: &self.namespace,
                    oracle_output: &self.output,
                    executed_prefix: &self.output[..self.consumed],
                });
            }
            let outcome = execute_statement(&parsed.stmt, &mut self.namespace, &mut self.host).await;
            self.consumed = (base + parsed.span.end).min(self.output.len());
            report.executed += 1;

            if let Err(err) = outcome.result {
                let kind = if err.is_undefined_variable() {
                    FailureKind::UndefinedVariable
                } else {
                    FailureKind::Runtime
                };
                tracing::debug!(%kind, statement = %text, error = %err, "statement failed");
                report.failures += 1;
                self.errors.push(StatementFailure {
                    kind,
                    statement: text.clone(),
                    message: err.to_string(),
                });
            }

            if outcome.halted {
                tracing::debug!(statement = %text, "host halted the turn");
                self.halted = true;
                report.halted = true;
                break;
            }

            if outcome.awaits > 0 {
                if outcome.awaits > self.suspend_warning {
                    tracing::warn!(
                        awaits = outcome.awaits,
                        statement = %text,
                        "statement completed many awaits without an intermediate checkpoint"
                    );
                }
                let point = SuspendPoint {
                    statement: text,
                    namespace: self.namespace.clone(),
                    oracle_output: self.output.clone(),
                    executed_prefix: self.output[..self.consumed].to_string(),
                    nested_suspends: outcome.awaits,
                };
                self.host.suspended(point);
                report.suspends += 1;
            }
        }
    }

    /// Local namespace of the turn.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Everything fed so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Prefix of the output that has been executed.
    pub fn executed_prefix(&self) -> &str {
        &self.output[..self.consumed]
    }

    /// Whether the host halted the turn.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Drain the statement failures collected so far.
    pub fn take_errors(&mut self) -> Vec<StatementFailure> {
        std::mem::take(&mut self.errors)
    }

    /// Borrow the host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Mutably borrow the host.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Consume the executor, returning the host and the namespace.
    pub fn into_parts(self) -> (H, Namespace) {
        (self.host, self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::exec::HostCall;
    use crate::interpreter::value::Value;
    use crate::interpreter::ExecError;
    use futures::future::BoxFuture;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct TestHost {
        calls: Vec<String>,
        vars: BTreeMap<String, Value>,
        points: Vec<SuspendPoint>,
        starts: Vec<(String, String, Option<Value>)>,
        halted: bool,
    }

    impl StatementHost for TestHost {
        fn is_host_function(&self, name: &str) -> bool {
            matches!(name, "Say" | "Return")
        }

        fn call(&mut self, call: HostCall) -> BoxFuture<'_, Result<Value, ExecError>> {
            Box::pin(async move {
                if call.function == "Return" {
                    self.halted = true;
                }
                let rendered: Vec<String> = call.args.iter().map(Value::repr).collect();
                self.calls
                    .push(format!("{}({})", call.function, rendered.join(", ")));
                Ok(Value::None)
            })
        }

        fn get_variable(&self, name: &str) -> Option<Value> {
            self.vars.get(name).cloned()
        }

        fn set_variable(&mut self, name: &str, value: Value) {
            self.vars.insert(name.to_string(), value);
        }

        fn suspended(&mut self, point: SuspendPoint) {
            self.points.push(point);
        }

        fn statement_started(&mut self, start: StatementStart<'_>) {
            self.starts.push((
                start.statement.to_string(),
                start.executed_prefix.to_string(),
                start.namespace.get("x").cloned(),
            ));
        }

        fn halted(&self) -> bool {
            self.halted
        }
    }

    const SCRIPT: &str = "x = 10\nawait Say('hi')\ny = 20\n";

    #[tokio::test]
    async fn executes_only_complete_statements() {
        let mut exec = IncrementalStatementExecutor::new(TestHost::default());

        let first = exec.feed("x = 10\nawait Sa").await;
        assert_eq!(first.executed, 1);
        assert_eq!(exec.namespace().get("x"), Some(&Value::Int(10)));
        assert!(exec.host().calls.is_empty());

        let second = exec.feed("y('hi')\ny = 20\n").await;
        assert_eq!(second.executed, 2);
        assert_eq!(second.suspends, 1);
        assert_eq!(exec.host().calls, vec!["Say('hi')"]);
        assert_eq!(exec.namespace().get("y"), Some(&Value::Int(20)));

        let point = &exec.host().points[0];
        assert_eq!(point.statement, "await Say('hi')");
        assert_eq!(point.executed_prefix, "x = 10\nawait Say('hi')\n");
        assert_eq!(point.oracle_output, SCRIPT);
        assert_eq!(point.namespace.get("y"), None);
    }

    #[tokio::test]
    async fn awaiting_statements_announce_where_they_start() {
        let mut exec = IncrementalStatementExecutor::new(TestHost::default());
        exec.feed(SCRIPT).await;

        assert_eq!(
            exec.host().starts,
            vec![(
                "await Say('hi')".to_string(),
                "x = 10\n".to_string(),
                Some(Value::Int(10)),
            )]
        );
    }

    #[tokio::test]
    async fn resume_skips_executed_prefix() {
        let mut exec = IncrementalStatementExecutor::new(TestHost::default());
        exec.feed("x = 10\nawait Say('hi')\ny = 2").await;
        let point = exec.host().points[0].clone();

        let resumed = IncrementalStatementExecutor::resume(
            TestHost::default(),
            point.namespace,
            SCRIPT,
            &point.executed_prefix,
        )
        .await;

        assert!(resumed.host().calls.is_empty(), "Say must not run twice");
        let expected: Namespace = [
            ("x".to_string(), Value::Int(10)),
            ("y".to_string(), Value::Int(20)),
        ]
        .into_iter()
        .collect();
        assert_eq!(resumed.namespace(), &expected);
        assert_eq!(resumed.executed_prefix(), SCRIPT);
    }

    #[tokio::test]
    async fn mismatched_prefix_replays_whole_output() {
        let resumed = IncrementalStatementExecutor::resume(
            TestHost::default(),
            Namespace::new(),
            SCRIPT,
            "x = 99\n",
        )
        .await;
        assert_eq!(resumed.host().calls, vec!["Say('hi')"]);
        assert_eq!(resumed.namespace().get("x"), Some(&Value::Int(10)));
    }

    #[tokio::test]
    async fn errors_are_collected_and_execution_continues() {
        let mut exec = IncrementalStatementExecutor::new(TestHost::default());
        let report = exec.feed("a = missing + 1\nb = 1 / 0\nc = 3\n").await;
        assert_eq!(report.executed, 3);
        assert_eq!(report.failures, 2);
        let errors = exec.take_errors();
        assert_eq!(errors[0].kind, FailureKind::UndefinedVariable);
        assert_eq!(errors[0].statement, "a = missing + 1");
        assert_eq!(errors[1].kind, FailureKind::Runtime);
        assert_eq!(exec.namespace().get("c"), Some(&Value::Int(3)));
        assert!(exec.take_errors().is_empty());
    }

    #[tokio::test]
    async fn finish_runs_unterminated_tail_and_reports_leftover() {
        let mut exec = IncrementalStatementExecutor::new(TestHost::default());
        exec.feed("if True:\n    z = 1\n").await;
        assert_eq!(exec.namespace().get("z"), None);
        let report = exec.finish().await;
        assert_eq!(report.executed, 1);
        assert_eq!(exec.namespace().get("z"), Some(&Value::Int(1)));

        let mut exec = IncrementalStatementExecutor::new(TestHost::default());
        exec.feed("w = 5\nv = (1,").await;
        let report = exec.finish().await;
        assert_eq!(exec.namespace().get("w"), Some(&Value::Int(5)));
        let leftover = report.leftover.expect("leftover text");
        assert_eq!(leftover.text, "v = (1,");
        assert!(exec.take_errors().is_empty());
    }

    #[tokio::test]
    async fn halt_discards_rest_of_turn() {
        let mut exec = IncrementalStatementExecutor::new(TestHost::default());
        let report = exec
            .feed("await Say('a')\nawait Return()\nawait Say('b')\n")
            .await;
        assert!(report.halted);
        assert_eq!(report.suspends, 1);
        assert_eq!(exec.host().calls, vec!["Say('a')", "Return()"]);
        assert!(exec.feed("await Say('c')\n").await.halted);
        assert_eq!(exec.host().calls.len(), 2);
    }

    fn split_points(text: &str, cuts: &[usize]) -> Vec<String> {
        let mut positions: Vec<usize> = cuts
            .iter()
            .map(|cut| cut % (text.len() + 1))
            .filter(|pos| text.is_char_boundary(*pos))
            .collect();
        positions.push(0);
        positions.push(text.len());
        positions.sort_unstable();
        positions.dedup();
        positions
            .windows(2)
            .map(|pair| text[pair[0]..pair[1]].to_string())
            .collect()
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_the_result(cuts in proptest::collection::vec(0usize..400, 0..12)) {
            let program = "total = 0\nfor n in range(4):\n    total += n\n    await Say(n)\nif total > 3:\n    label = 'big'\nelse:\n    label = 'small'\nawait Say(label)\ndone = True\n";

            let (whole_ns, whole_calls) = futures::executor::block_on(async {
                let mut exec = IncrementalStatementExecutor::new(TestHost::default());
                exec.feed(program).await;
                exec.finish().await;
                let calls = exec.host().calls.clone();
                (exec.namespace().clone(), calls)
            });

            let (split_ns, split_calls) = futures::executor::block_on(async {
                let mut exec = IncrementalStatementExecutor::new(TestHost::default());
                for chunk in split_points(program, &cuts) {
                    exec.feed(&chunk).await;
                }
                exec.finish().await;
                let calls = exec.host().calls.clone();
                (exec.namespace().clone(), calls)
            });

            prop_assert_eq!(whole_ns, split_ns);
            prop_assert_eq!(whole_calls, split_calls);
        }
    }
}
