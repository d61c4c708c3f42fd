//! Integration tests for program recovery
//!
//! Each test runs a program until its bus goes idle, then starts a second
//! program over the same storage root, the way a restarted process would.

use encore::runtime::storage::{CheckpointStore, FilesystemCheckpointStore};
use encore::runtime::{
    Program, RecoveryPhase, ResumeRequest, RuntimeConfig, ScriptedOracle, WorkflowSet,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PLANNER: &str = "\
# Planner
Plans the work.

## Main
trigger: begin
- 01: Break the task down
- 02: Do the work
- 03: Wait for feedback
";

const TEAM: &str = "\
# Alpha
Coordinates the team.

## Main
trigger: begin
- 01: Create a helper and greet it

# Beta
Helps out.
startup: no

## Main
trigger: begin
- 01: Get ready
";

fn program(root: &Path, source: &str, oracle: Arc<ScriptedOracle>) -> Program {
    Program::new(
        RuntimeConfig::with_root(root),
        WorkflowSet::from_source(source).unwrap(),
        oracle,
    )
}

#[tokio::test]
async fn test_nested_frame_resumes_at_recorded_step() {
    let temp = TempDir::new().unwrap();

    let oracle = Arc::new(ScriptedOracle::new().script(
        "Planner",
        [
            "await Call('Main')\n",
            "await Step('Main:03')\nmsg = await WaitForMessage()\n",
        ],
    ));
    let mut first = program(temp.path(), PLANNER, oracle.clone());
    let report = first.run(ResumeRequest::Fresh).await.unwrap();
    assert_eq!(oracle.requests().len(), 2);

    // The bus closed while the nested frame was waiting; nothing was popped
    let planner = first.agent("1000").unwrap();
    assert_eq!(planner.call_stack().to_string(), "Main:01, Main:03");
    let latest = planner.checkpoints().latest().unwrap().unwrap();
    assert_eq!(latest.metadata.call_stack.len(), 2);
    assert_eq!(latest.metadata.statement, "await Step('Main:03')");

    let resumed_oracle = Arc::new(ScriptedOracle::new());
    let mut second = program(temp.path(), PLANNER, resumed_oracle.clone());
    let start = second.prepare(ResumeRequest::Auto).unwrap();
    assert!(start.resumed);
    assert_eq!(start.session_id, report.session_id);

    let planner = second.agent("1000").unwrap();
    assert_eq!(planner.call_stack().to_string(), "Main:01, Main:03");
    assert!(planner.has_pending_turn());

    second.start().unwrap();
    second.wait().await.unwrap();
    assert_eq!(second.phase(), Some(RecoveryPhase::ResumedRunning));

    // Restored agents do not introduce themselves again, and the in-flight
    // turn finished without asking the oracle for anything
    assert_eq!(second.bus().unwrap().introductions("1000"), 0);
    assert!(resumed_oracle.requests().is_empty());
}

#[tokio::test]
async fn test_caller_turn_continues_after_callee_resumes() {
    const LEAD: &str = "\
# Lead
Leads the review.

## Main
trigger: begin
- 01: Announce the review and report the verdict

## Review
- 01: Wait for notes and return a verdict
";
    let temp = TempDir::new().unwrap();

    let oracle = Arc::new(ScriptedOracle::new().script(
        "Lead",
        [
            "await Say('starting')\nverdict = await Call('Review')\nawait Say(f'verdict {verdict}')\nawait Return()\n",
            "await Step('Review:01')\nnote = await WaitForMessage()\nawait Return('approved')\n",
        ],
    ));
    let mut first = program(temp.path(), LEAD, oracle);
    let report = first.run(ResumeRequest::Fresh).await.unwrap();
    let said = |transcript: &[encore::runtime::TranscriptEntry]| -> Vec<String> {
        transcript
            .iter()
            .filter(|entry| entry.from == "1000")
            .map(|entry| entry.content.clone())
            .collect()
    };
    assert_eq!(
        said(&report.transcript),
        vec!["Lead(agent 1000): Leads the review.", "starting"]
    );

    // Killed inside Review; the caller's turn is parked on its frame
    let lead = first.agent("1000").unwrap();
    assert_eq!(lead.call_stack().to_string(), "Main:01, Review:01");
    let latest = lead.checkpoints().latest().unwrap().unwrap();
    let parked = latest.metadata.call_stack[0].parked_turn.clone().unwrap();
    assert_eq!(parked.executed_prefix, "await Say('starting')\n");
    assert_eq!(parked.call_result, None);

    let resumed_oracle = Arc::new(ScriptedOracle::new());
    let mut second = program(temp.path(), LEAD, resumed_oracle.clone());
    assert!(second.prepare(ResumeRequest::Auto).unwrap().resumed);
    second
        .post("1000", encore::interpreter::Value::Str("looks good".to_string()))
        .unwrap();
    second.start().unwrap();
    let resumed = second.wait().await.unwrap();

    assert_eq!(said(&resumed.transcript), vec!["verdict approved"]);
    assert!(resumed_oracle.requests().is_empty());
    assert!(second.agent("1000").unwrap().call_stack().is_empty());
}

#[tokio::test]
async fn test_dynamically_created_agents_are_restored() {
    let temp = TempDir::new().unwrap();

    let oracle = Arc::new(
        ScriptedOracle::new()
            .script(
                "Alpha",
                ["b = await CreateAgent('Beta')\nawait SendMessage(b, 'hello')\n"],
            )
            .script("Beta", ["await Step('Main:01')\n"]),
    );
    let mut first = program(temp.path(), TEAM, oracle);
    let report = first.run(ResumeRequest::Fresh).await.unwrap();
    assert_eq!(report.agents.len(), 2);

    let beta = first.agent("1001").unwrap();
    assert_eq!(beta.class_name(), "Beta");
    let message = beta.state().get_variable("message").cloned().unwrap();
    assert!(message.to_string().contains("hello"));

    let mut second = program(temp.path(), TEAM, Arc::new(ScriptedOracle::new()));
    let start = second.prepare(ResumeRequest::Auto).unwrap();
    let restore = start.restore.clone().unwrap();
    assert_eq!(restore.to_string(), "2/2 agents restored");

    let beta = second.agent("1001").unwrap();
    assert_eq!(beta.class_name(), "Beta");
    assert_eq!(beta.state().get_variable("message").cloned(), Some(message));

    second.start().unwrap();
    let resumed = second.wait().await.unwrap();
    assert_eq!(resumed.agents.len(), 2);
    assert_eq!(second.bus().unwrap().introductions("1000"), 0);
    assert_eq!(second.bus().unwrap().introductions("1001"), 0);
}

#[tokio::test]
async fn test_resume_without_checkpoints_starts_fresh_in_same_session() {
    let temp = TempDir::new().unwrap();

    let mut program = program(temp.path(), PLANNER, Arc::new(ScriptedOracle::new()));
    let start = program
        .prepare(ResumeRequest::Explicit("never-ran".to_string()))
        .unwrap();
    assert!(!start.resumed);
    assert_eq!(start.session_id, "never-ran");
    assert_eq!(program.phase(), Some(RecoveryPhase::FreshStart));

    program.start().unwrap();
    let report = program.wait().await.unwrap();
    assert_eq!(program.phase(), Some(RecoveryPhase::Running));
    assert_eq!(report.session_id, "never-ran");
    assert_eq!(program.bus().unwrap().introductions("1000"), 1);
}

#[tokio::test]
async fn test_corrupt_program_checkpoint_falls_back_to_new_session() {
    let temp = TempDir::new().unwrap();

    let mut first = program(temp.path(), PLANNER, Arc::new(ScriptedOracle::new()));
    let report = first.run(ResumeRequest::Fresh).await.unwrap();
    let session = report.session_id.clone();

    let config = RuntimeConfig::with_root(temp.path());
    let store = FilesystemCheckpointStore::new(config.session_dir(&session), config.max_checkpoint_bytes);
    let execution = format!("{}_program", session);
    let latest = store.latest(&execution).unwrap().unwrap();
    store.put(&latest, b"{\"truncated\": ").unwrap();

    let mut second = program(temp.path(), PLANNER, Arc::new(ScriptedOracle::new()));
    let start = second.prepare(ResumeRequest::Explicit(session.clone())).unwrap();
    assert!(!start.resumed);
    assert_ne!(start.session_id, session);
    assert_eq!(start.agents.len(), 1);

    second.start().unwrap();
    second.wait().await.unwrap();
    assert_eq!(second.bus().unwrap().introductions("1000"), 1);
}

#[tokio::test]
async fn test_post_reaches_message_handler() {
    const ECHO: &str = "\
# Echo
Repeats what it hears.

## Main
trigger: message
- 01: Say the message back
";
    let temp = TempDir::new().unwrap();
    let oracle = Arc::new(ScriptedOracle::new().script(
        "Echo",
        ["await Say($message['content'])\nawait Return()\n"],
    ));
    let mut program = program(temp.path(), ECHO, oracle);
    program.prepare(ResumeRequest::Fresh).unwrap();
    program
        .post("1000", encore::interpreter::Value::Str("ping".to_string()))
        .unwrap();
    program.start().unwrap();

    let report = program.wait().await.unwrap();
    let said: Vec<&str> = report
        .transcript
        .iter()
        .filter(|entry| entry.from == "1000")
        .map(|entry| entry.content.as_str())
        .collect();
    assert_eq!(said, vec!["Echo(agent 1000): Repeats what it hears.", "ping"]);
}
