//! Offloading actions to an external build service.
//!
//! Eligible actions are written to a script that the service executable runs
//! in one go. Its exit status decides all of their records; the remaining
//! actions then go through the local loop, gated on those records.

use super::local::{LocalExecutor, run_process};
use super::types::{ActionOutcome, ExecutionRecord, ExecutionSummary};
use crate::action_graph::{ActionId, BuildAction};
use crate::config::ExecutorConfig;
use crate::error::{BuildError, BuildResult};
use crate::host::ProcessHost;
use kiln_cache::FileIdentity;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

pub struct BuildServiceExecutor {
    executable: PathBuf,
    script_path: PathBuf,
    local: LocalExecutor,
}

impl BuildServiceExecutor {
    /// Set up the executor if the service is installed and its agent runs.
    ///
    /// The script is written to `script_dir`.
    #[must_use]
    pub fn probe(config: &ExecutorConfig, script_dir: &Path, host: &dyn ProcessHost) -> Option<Self> {
        let service = &config.build_service;
        let Some(root) = host.env_var(&service.root_env) else {
            debug!("{} is not set, build service unavailable", service.root_env);
            return None;
        };
        let executable = PathBuf::from(root).join(&service.executable);
        if !executable.is_file() {
            debug!("Build service executable {} not found", executable.display());
            return None;
        }
        if !host.is_process_running(&service.agent_process) {
            debug!("Build service agent {} is not running", service.agent_process);
            return None;
        }

        Some(Self {
            executable,
            script_path: script_dir.join(&service.script_name),
            local: LocalExecutor::from_config(config, host),
        })
    }

    pub async fn execute(&self, actions: &[BuildAction]) -> BuildResult<ExecutionSummary> {
        let eligible = service_actions(actions);
        let mut seeded = BTreeMap::new();

        if !eligible.is_empty() {
            write_script(&self.script_path, &eligible)?;
            info!(
                "Running {} action(s) through the build service",
                eligible.len()
            );

            let started = Instant::now();
            let script = self.script_path.to_string_lossy().into_owned();
            let directory = self.script_path.parent().unwrap_or(Path::new("."));
            let outcome = run_process(&self.executable, &[script], directory)
                .await
                .unwrap_or_else(|e| ActionOutcome::not_started(&e));
            let elapsed = started.elapsed();

            if !outcome.success() {
                tracing::error!(
                    "Build service failed with exit code {}\n{}",
                    outcome.exit_code,
                    outcome.output.trim_end()
                );
            }
            for action in &eligible {
                let _ = seeded.insert(
                    action.id(),
                    ExecutionRecord::finished(outcome.clone(), elapsed),
                );
            }
        }

        Ok(self.local.execute_seeded(actions, seeded).await)
    }
}

/// Actions the service may run, in an order where producers come first.
///
/// An action qualifies when it allows the service and none of its in-batch
/// producers is left to run locally.
#[must_use]
pub fn service_actions(actions: &[BuildAction]) -> Vec<&BuildAction> {
    let producers: HashMap<&FileIdentity, ActionId> = actions
        .iter()
        .flat_map(|action| action.produced.iter().map(move |item| (item, action.id())))
        .collect();
    let in_batch_producers = |action: &BuildAction| -> Vec<ActionId> {
        action
            .prerequisites
            .iter()
            .filter_map(|item| producers.get(item).copied())
            .filter(|&producer| producer != action.id())
            .collect()
    };

    let mut eligible: BTreeSet<ActionId> = actions
        .iter()
        .filter(|action| action.can_execute_with_build_service)
        .map(BuildAction::id)
        .collect();
    loop {
        let local_only: Vec<ActionId> = actions
            .iter()
            .filter(|action| eligible.contains(&action.id()))
            .filter(|action| {
                in_batch_producers(action)
                    .iter()
                    .any(|producer| !eligible.contains(producer))
            })
            .map(BuildAction::id)
            .collect();
        if local_only.is_empty() {
            break;
        }
        for id in local_only {
            let _ = eligible.remove(&id);
        }
    }

    let mut ordered = Vec::with_capacity(eligible.len());
    let mut emitted = BTreeSet::new();
    while emitted.len() < eligible.len() {
        let before = emitted.len();
        for action in actions {
            if eligible.contains(&action.id())
                && !emitted.contains(&action.id())
                && in_batch_producers(action)
                    .iter()
                    .all(|producer| emitted.contains(producer))
            {
                let _ = emitted.insert(action.id());
                ordered.push(action);
            }
        }
        if emitted.len() == before {
            break;
        }
    }
    ordered
}

fn write_script(path: &Path, actions: &[&BuildAction]) -> BuildResult<()> {
    let mut script = String::from("# Generated by kiln\n");
    for action in actions {
        let _ = writeln!(
            script,
            "cd \"{}\" && {}",
            action.working_directory.display(),
            action.command_line()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    std::fs::write(path, script).map_err(|e| BuildError::io(path, e))
}
