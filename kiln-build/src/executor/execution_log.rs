//! Failure reports and timing statistics for executed actions.

use super::types::{ActionOutcome, ActionState, ExecutionSummary};
use crate::action_graph::BuildAction;
use std::fmt::Write as _;
use std::time::Duration;

/// Characters of the command line kept in failure reports.
const COMMAND_TAIL_CHARS: usize = 256;

/// Last part of the command line; the interesting arguments are at the end.
#[must_use]
pub fn command_tail(action: &BuildAction) -> String {
    let line = action.command_line();
    let count = line.chars().count();
    if count <= COMMAND_TAIL_CHARS {
        line
    } else {
        let tail: String = line.chars().skip(count - COMMAND_TAIL_CHARS).collect();
        format!("...{tail}")
    }
}

/// Multi-line report for an action that exited with an error.
#[must_use]
pub fn format_failure(action: &BuildAction, outcome: &ActionOutcome) -> String {
    let mut report = format!(
        "{} failed with exit code {}: {}\n  command: {}",
        action.tool_name(),
        outcome.exit_code,
        action.description(),
        command_tail(action)
    );
    let output = outcome.output.trim_end();
    if !output.is_empty() {
        report.push('\n');
        report.push_str(output);
    }
    report
}

pub fn log_failure(action: &BuildAction, outcome: &ActionOutcome) {
    tracing::error!("{}", format_failure(action, outcome));
}

/// Per-action timing table, slowest first.
#[must_use]
pub fn format_action_stats(actions: &[BuildAction], summary: &ExecutionSummary) -> String {
    let mut rows: Vec<(&BuildAction, Duration, ActionState)> = actions
        .iter()
        .filter_map(|action| {
            let record = summary.records.get(&action.id())?;
            Some((action, record.duration.unwrap_or_default(), record.state))
        })
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id().cmp(&b.0.id())));

    let mut table = String::from("Detailed action stats:\n");
    let _ = writeln!(table, "{:<12} {:>10}  {:<10} {}", "Tool", "Seconds", "State", "Action");
    for (action, duration, state) in rows {
        let state = match state {
            ActionState::Complete => "ok",
            ActionState::Failed => "failed",
            ActionState::SkippedDueToFailedPrerequisite => "skipped",
            ActionState::Running => "running",
            ActionState::Pending => "pending",
        };
        let _ = writeln!(
            table,
            "{:<12} {:>10.2}  {:<10} {}",
            action.tool_name(),
            duration.as_secs_f64(),
            state,
            action.description()
        );
    }
    table
}

pub fn log_action_stats(actions: &[BuildAction], summary: &ExecutionSummary) {
    tracing::info!("{}", format_action_stats(actions, summary));
}
