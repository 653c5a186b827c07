//! Core types for action execution

use crate::action_graph::ActionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Failures of the execution machinery itself, as opposed to an action
/// exiting with a non-zero code.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: PathBuf,
        source: std::io::Error,
    },

    /// The connection to a remote host failed; the command may not have run.
    #[error("Remote transport error: {0}")]
    Transport(String),

    #[error("Execution backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit code and captured output of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub exit_code: i32,
    /// Standard output followed by standard error.
    pub output: String,
}

impl ActionOutcome {
    /// Exit code reported when a command could not be run at all.
    pub const NOT_STARTED: i32 = -1;

    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Outcome for a command that never ran.
    #[must_use]
    pub fn not_started(error: &ExecutorError) -> Self {
        Self {
            exit_code: Self::NOT_STARTED,
            output: error.to_string(),
        }
    }

    pub(crate) fn from_output(output: &std::process::Output) -> Self {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            exit_code: output.status.code().unwrap_or(Self::NOT_STARTED),
            output: text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    /// Waiting for a slot or for its prerequisites.
    Pending,
    Running,
    Complete,
    Failed,
    /// Never started because a prerequisite failed or was skipped.
    SkippedDueToFailedPrerequisite,
}

impl ActionState {
    #[must_use]
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Finished without producing its outputs.
    #[must_use]
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, Self::Failed | Self::SkippedDueToFailedPrerequisite)
    }
}

/// What happened to one action.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub state: ActionState,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub output: String,
}

impl ExecutionRecord {
    pub(crate) fn pending() -> Self {
        Self {
            state: ActionState::Pending,
            exit_code: None,
            started_at: None,
            duration: None,
            output: String::new(),
        }
    }

    pub(crate) fn running() -> Self {
        Self {
            state: ActionState::Running,
            exit_code: None,
            started_at: Some(Utc::now()),
            duration: None,
            output: String::new(),
        }
    }

    pub(crate) fn skipped() -> Self {
        Self {
            state: ActionState::SkippedDueToFailedPrerequisite,
            exit_code: None,
            started_at: None,
            duration: None,
            output: String::new(),
        }
    }

    /// Record for an action finished outside the scheduling loop.
    #[must_use]
    pub fn finished(outcome: ActionOutcome, duration: Duration) -> Self {
        Self {
            state: if outcome.success() {
                ActionState::Complete
            } else {
                ActionState::Failed
            },
            exit_code: Some(outcome.exit_code),
            started_at: None,
            duration: Some(duration),
            output: outcome.output,
        }
    }
}

/// Result of running a batch of actions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub records: BTreeMap<ActionId, ExecutionRecord>,
    pub total_duration: Duration,
    /// Highest number of actions running at once.
    pub max_concurrency: usize,
}

impl ExecutionSummary {
    /// True when every action completed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.records.values().all(|r| r.state == ActionState::Complete)
    }

    fn count(&self, state: ActionState) -> usize {
        self.records.values().filter(|r| r.state == state).count()
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(ActionState::Complete)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(ActionState::Failed)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(ActionState::SkippedDueToFailedPrerequisite)
    }

    /// Ids of completed actions.
    pub fn completed_actions(&self) -> impl Iterator<Item = ActionId> + '_ {
        self.records
            .iter()
            .filter(|(_, r)| r.state == ActionState::Complete)
            .map(|(&id, _)| id)
    }

    #[must_use]
    pub fn state_of(&self, id: ActionId) -> Option<ActionState> {
        self.records.get(&id).map(|r| r.state)
    }

    /// Format as a human-readable summary
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "Execution Summary:\n  Total: {} action(s)\n  Completed: {}\n  Failed: {}\n  Skipped: {}\n  Duration: {:?}\n  Max concurrency: {}",
            self.records.len(),
            self.completed(),
            self.failed(),
            self.skipped(),
            self.total_duration,
            self.max_concurrency
        )
    }
}
