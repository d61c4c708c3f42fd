//! Resume entry state machine and session selection

use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::error::{SessionError, SessionResult};
use super::session::{SessionRegistry, workflow_set_hash};

/// How a run should treat existing checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumeRequest {
    /// Ignore checkpoints and start a new session
    #[default]
    Fresh,
    /// Resume the last session of this workflow set
    Auto,
    /// Resume a specific session
    Explicit(String),
}

impl ResumeRequest {
    /// Map a `--resume [ID]` flag: absent, bare, or with a value
    pub fn from_flag(flag: Option<Option<String>>) -> Self {
        match flag {
            None => ResumeRequest::Fresh,
            Some(None) => ResumeRequest::Auto,
            Some(Some(id)) => ResumeRequest::Explicit(id),
        }
    }
}

/// Phase of program startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Starting without checkpoints
    FreshStart,
    /// Running a fresh session
    Running,
    /// Resume asked for, session not selected yet
    ResumeRequested,
    /// Restoring agents from checkpoints
    Restoring,
    /// Running a restored session
    ResumedRunning,
}

impl RecoveryPhase {
    /// Whether `next` may follow `self`
    pub fn can_transition_to(self, next: RecoveryPhase) -> bool {
        use RecoveryPhase::*;
        matches!(
            (self, next),
            (FreshStart, Running)
                | (ResumeRequested, Restoring)
                | (ResumeRequested, FreshStart)
                | (Restoring, ResumedRunning)
                | (Restoring, FreshStart)
        )
    }
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryPhase::FreshStart => "FRESH_START",
            RecoveryPhase::Running => "RUNNING",
            RecoveryPhase::ResumeRequested => "RESUME_REQUESTED",
            RecoveryPhase::Restoring => "RESTORING",
            RecoveryPhase::ResumedRunning => "RESUMED_RUNNING",
        };
        write!(f, "{}", name)
    }
}

/// Session chosen for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    /// Session id
    pub session_id: String,
    /// Whether checkpoints should be restored
    pub resume: bool,
}

/// Drives session selection and the startup phases
pub struct RecoveryCoordinator {
    phase: RecoveryPhase,
    sessions: SessionRegistry,
    workflow_hash: String,
}

impl RecoveryCoordinator {
    /// Start in `FreshStart` or `ResumeRequested` depending on `request`
    pub fn new(
        sessions: SessionRegistry,
        request: &ResumeRequest,
        workflow_paths: &[PathBuf],
    ) -> SessionResult<Self> {
        let phase = match request {
            ResumeRequest::Fresh => RecoveryPhase::FreshStart,
            _ => RecoveryPhase::ResumeRequested,
        };
        Ok(Self {
            phase,
            sessions,
            workflow_hash: workflow_set_hash(workflow_paths)?,
        })
    }

    /// Current phase
    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Hash of the workflow files this program runs
    pub fn workflow_hash(&self) -> &str {
        &self.workflow_hash
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: RecoveryPhase) -> SessionResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(from = %self.phase, to = %next, "recovery phase");
        self.phase = next;
        Ok(())
    }

    /// Pick the session for `request`
    pub fn select_session(&mut self, request: &ResumeRequest) -> SessionResult<SessionPlan> {
        let existing = match request {
            ResumeRequest::Fresh => None,
            ResumeRequest::Explicit(id) => Some(id.clone()),
            ResumeRequest::Auto => {
                let found = self.sessions.lookup(&self.workflow_hash);
                if found.is_none() {
                    tracing::warn!(
                        hash = %self.workflow_hash,
                        "no previous session for these workflows; starting fresh"
                    );
                }
                found
            }
        };

        match existing {
            Some(session_id) => {
                self.transition(RecoveryPhase::Restoring)?;
                self.sessions.record(&self.workflow_hash, &session_id)?;
                tracing::info!(session = %session_id, "resuming session");
                Ok(SessionPlan {
                    session_id,
                    resume: true,
                })
            }
            None => {
                if self.phase == RecoveryPhase::ResumeRequested {
                    self.transition(RecoveryPhase::FreshStart)?;
                }
                let session_id = self.new_session()?;
                Ok(SessionPlan {
                    session_id,
                    resume: false,
                })
            }
        }
    }

    /// Abandon a restore attempt and register a new session
    pub fn fall_back_to_fresh(&mut self) -> SessionResult<String> {
        self.transition(RecoveryPhase::FreshStart)?;
        self.new_session()
    }

    /// Abandon a restore attempt but keep the session (it had no checkpoints)
    pub fn fresh_in_session(&mut self) -> SessionResult<()> {
        self.transition(RecoveryPhase::FreshStart)
    }

    /// Enter the running phase that matches how the program started
    pub fn running(&mut self) -> SessionResult<()> {
        match self.phase {
            RecoveryPhase::Restoring => self.transition(RecoveryPhase::ResumedRunning),
            _ => self.transition(RecoveryPhase::Running),
        }
    }

    fn new_session(&mut self) -> SessionResult<String> {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.record(&self.workflow_hash, &session_id)?;
        tracing::info!(session = %session_id, "starting new session");
        Ok(session_id)
    }
}
