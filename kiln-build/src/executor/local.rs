//! Running actions as child processes on this machine.

use super::scheduler::{ActionRunner, Scheduler};
use super::types::{ActionOutcome, ExecutionRecord, ExecutionSummary, ExecutorError};
use crate::action_graph::{ActionId, BuildAction};
use crate::config::ExecutorConfig;
use crate::host::ProcessHost;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tracing::debug;

/// Run `command` with `arguments` in `working_directory` and capture its
/// output.
pub async fn run_process(
    command: &Path,
    arguments: &[String],
    working_directory: &Path,
) -> Result<ActionOutcome, ExecutorError> {
    debug!("Running {} {}", command.display(), arguments.join(" "));
    let output = tokio::process::Command::new(command)
        .args(arguments)
        .current_dir(working_directory)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ExecutorError::Spawn {
            command: command.to_path_buf(),
            source,
        })?;
    Ok(ActionOutcome::from_output(&output))
}

/// Runs every action as a local child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

#[async_trait]
impl ActionRunner for LocalRunner {
    async fn run(&self, action: &BuildAction) -> ActionOutcome {
        run_process(&action.command_path, &action.arguments, &action.working_directory)
            .await
            .unwrap_or_else(|e| ActionOutcome::not_started(&e))
    }
}

/// How many actions may run locally at once.
///
/// `max_local_actions` wins when set; otherwise the processor count scaled
/// by `processor_multiplier`. Never less than one.
#[must_use]
pub fn local_concurrency(config: &ExecutorConfig, host: &dyn ProcessHost) -> usize {
    if config.max_local_actions > 0 {
        return config.max_local_actions;
    }
    let processors = host.processor_count().max(1);
    let multiplier = if config.processor_multiplier.is_finite() && config.processor_multiplier > 0.0
    {
        config.processor_multiplier
    } else {
        1.0
    };
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = (processors as f64 * multiplier).round() as usize;
    scaled.max(1)
}

pub struct LocalExecutor {
    scheduler: Scheduler,
}

impl LocalExecutor {
    #[must_use]
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    #[must_use]
    pub fn from_config(config: &ExecutorConfig, host: &dyn ProcessHost) -> Self {
        Self::new(
            Scheduler::new(local_concurrency(config, host))
                .with_poll_interval(config.poll_interval())
                .with_detailed_stats(config.log_detailed_action_stats),
        )
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn execute(&self, actions: &[BuildAction]) -> ExecutionSummary {
        self.execute_seeded(actions, BTreeMap::new()).await
    }

    /// Run the actions that have no record in `seeded`.
    pub async fn execute_seeded(
        &self,
        actions: &[BuildAction],
        seeded: BTreeMap<ActionId, ExecutionRecord>,
    ) -> ExecutionSummary {
        self.scheduler
            .run(actions, Arc::new(LocalRunner), seeded)
            .await
    }
}
