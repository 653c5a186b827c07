//! Distributed compilation through a slot coordinator.
//!
//! Remotable compiles are run as `<coordinator> -s <host> <dispatcher>
//! <compiler> <args>`: the coordinator leases a build host and the
//! dispatcher ships the compile there. Everything else runs locally.

use super::local::{LocalRunner, run_process};
use super::scheduler::{ActionRunner, Scheduler};
use super::types::{ActionOutcome, ExecutionSummary};
use crate::action_graph::{ActionKind, BuildAction};
use crate::config::{DistributedConfig, ExecutorConfig};
use crate::host::{ProcessHost, find_executable};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Overrides the number of concurrent distributed actions.
pub const DISTRIBUTED_JOBS_ENV: &str = "KILN_DISTRIBUTED_JOBS";

/// Sum of CPU counts in a hosts-info manifest.
///
/// Each line is `<host> <cpus> [...]`; blank lines, comments and malformed
/// lines are skipped.
#[must_use]
pub fn parse_hosts_info(content: &str) -> usize {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().nth(1)?.parse::<usize>().ok())
        .sum()
}

/// Concurrency for distributed builds: env override, else manifest total,
/// else the local processor count.
#[must_use]
pub fn distributed_concurrency(config: &DistributedConfig, host: &dyn ProcessHost) -> usize {
    if let Some(jobs) = host
        .env_var(DISTRIBUTED_JOBS_ENV)
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|&jobs| jobs > 0)
    {
        return jobs;
    }

    match std::fs::read_to_string(&config.hosts_info) {
        Ok(content) => {
            let cpus = parse_hosts_info(&content);
            if cpus > 0 {
                return cpus;
            }
            debug!("{} lists no build hosts", config.hosts_info.display());
        }
        Err(e) => debug!("Could not read {}: {}", config.hosts_info.display(), e),
    }
    host.processor_count().max(1)
}

/// Runs remotable compiles under the coordinator and the rest locally.
pub struct DistributedRunner {
    coordinator: PathBuf,
    dispatcher: PathBuf,
    config: DistributedConfig,
}

impl DistributedRunner {
    #[must_use]
    pub fn new(coordinator: PathBuf, dispatcher: PathBuf, config: DistributedConfig) -> Self {
        Self {
            coordinator,
            dispatcher,
            config,
        }
    }

    /// Arguments passed to the coordinator for `action`.
    #[must_use]
    pub fn dispatch_arguments(&self, action: &BuildAction) -> Vec<String> {
        let mut arguments = vec![
            "-s".to_string(),
            self.config.coordinator_host.clone(),
            self.dispatcher.to_string_lossy().into_owned(),
            action.command_path.to_string_lossy().into_owned(),
        ];
        arguments.extend(action.arguments.iter().cloned());
        arguments.extend(self.config.extra_compile_flags.iter().cloned());
        arguments
    }

    fn is_dispatched(action: &BuildAction) -> bool {
        action.kind == ActionKind::Compile && action.can_execute_remotely
    }
}

/// Exit codes the dispatcher uses for its own failures, as opposed to the
/// compiler's.
fn is_dispatch_failure(exit_code: i32) -> bool {
    exit_code == ActionOutcome::NOT_STARTED || (100..=128).contains(&exit_code)
}

#[async_trait]
impl ActionRunner for DistributedRunner {
    async fn run(&self, action: &BuildAction) -> ActionOutcome {
        if !Self::is_dispatched(action) {
            return LocalRunner.run(action).await;
        }

        let outcome = run_process(
            &self.coordinator,
            &self.dispatch_arguments(action),
            &action.working_directory,
        )
        .await
        .unwrap_or_else(|e| ActionOutcome::not_started(&e));

        if !outcome.success() && self.config.local_fallback && is_dispatch_failure(outcome.exit_code)
        {
            warn!(
                "Distributed compile of {} failed with {}, retrying locally",
                action.description(),
                outcome.exit_code
            );
            return LocalRunner.run(action).await;
        }
        outcome
    }
}

pub struct DistributedExecutor {
    scheduler: Scheduler,
    runner: Arc<DistributedRunner>,
}

impl DistributedExecutor {
    /// Set up the executor if the coordinator and dispatcher can be found.
    #[must_use]
    pub fn probe(config: &ExecutorConfig, host: &dyn ProcessHost) -> Option<Self> {
        let distributed = &config.distributed;
        let coordinator = find_tool(&distributed.coordinator, host)?;
        let dispatcher = find_tool(&distributed.dispatcher, host)?;

        let concurrency = distributed_concurrency(distributed, host);
        info!(
            "Distributed build via {} with up to {} action(s)",
            coordinator.display(),
            concurrency
        );
        Some(Self {
            scheduler: Scheduler::new(concurrency)
                .with_poll_interval(config.poll_interval())
                .with_detailed_stats(config.log_detailed_action_stats),
            runner: Arc::new(DistributedRunner::new(
                coordinator,
                dispatcher,
                distributed.clone(),
            )),
        })
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn execute(&self, actions: &[BuildAction]) -> ExecutionSummary {
        let runner: Arc<dyn ActionRunner> = self.runner.clone();
        self.scheduler.run(actions, runner, BTreeMap::new()).await
    }
}

fn find_tool(tool: &Path, host: &dyn ProcessHost) -> Option<PathBuf> {
    let found = find_executable(tool, host);
    if found.is_none() {
        warn!("Distributed build tool {} not found", tool.display());
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_graph::ActionGraph;
    use crate::host::testing::FakeHost;
    use tempfile::TempDir;

    #[test]
    fn hosts_info_sums_cpus() {
        let manifest = "# build farm\n10.0.0.1 16 3\n10.0.0.2 8\n\nbroken line\n10.0.0.3 x 1\n";
        assert_eq!(parse_hosts_info(manifest), 24);
        assert_eq!(parse_hosts_info(""), 0);
    }

    #[test]
    fn concurrency_sources_in_order() {
        let tmp = TempDir::new().unwrap();
        let manifest = tmp.path().join("hosts-info");
        std::fs::write(&manifest, "a 12\nb 4\n").unwrap();
        let config = DistributedConfig {
            hosts_info: manifest,
            ..DistributedConfig::default()
        };

        let mut host = FakeHost::with_processors(6);
        assert_eq!(distributed_concurrency(&config, &host), 16);

        let _ = host.env.insert(DISTRIBUTED_JOBS_ENV.to_string(), "40".to_string());
        assert_eq!(distributed_concurrency(&config, &host), 40);

        let missing = DistributedConfig {
            hosts_info: tmp.path().join("absent"),
            ..DistributedConfig::default()
        };
        assert_eq!(distributed_concurrency(&missing, &FakeHost::with_processors(6)), 6);
    }

    #[test]
    fn compiles_are_wrapped_with_warning_flags() {
        let mut graph = ActionGraph::new();
        let action = graph.add(ActionKind::Compile);
        action.command_path = PathBuf::from("/usr/bin/clang++");
        action.arguments = vec!["-c".into(), "a.cpp".into()];
        action.can_execute_remotely = true;
        let action = action.clone();

        let runner = DistributedRunner::new(
            PathBuf::from("/usr/bin/gethost"),
            PathBuf::from("/usr/bin/distcc"),
            DistributedConfig::default(),
        );
        assert_eq!(
            runner.dispatch_arguments(&action),
            vec![
                "-s",
                "localhost",
                "/usr/bin/distcc",
                "/usr/bin/clang++",
                "-c",
                "a.cpp",
                "-Wno-parentheses-equality",
                "-Wno-unused-value"
            ]
        );
        assert!(DistributedRunner::is_dispatched(&action));

        let link = graph.add(ActionKind::Link).clone();
        assert!(!DistributedRunner::is_dispatched(&link));
    }

    #[test]
    fn compiler_errors_are_not_dispatch_failures() {
        assert!(!is_dispatch_failure(1));
        assert!(is_dispatch_failure(ActionOutcome::NOT_STARTED));
        assert!(is_dispatch_failure(110));
    }

    #[test]
    fn probe_requires_both_tools() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("gethost"), "").unwrap();
        let mut host = FakeHost::with_processors(2);
        let _ = host
            .env
            .insert("PATH".to_string(), tmp.path().display().to_string());
        let config = ExecutorConfig::default();

        assert!(DistributedExecutor::probe(&config, &host).is_none());

        std::fs::write(tmp.path().join("distcc"), "").unwrap();
        let executor = DistributedExecutor::probe(&config, &host).unwrap();
        assert!(executor.scheduler().max_concurrency() >= 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_dispatch_falls_back_to_local() {
        let mut graph = ActionGraph::new();
        let action = graph.add(ActionKind::Compile);
        action.command_path = PathBuf::from("true");
        action.can_execute_remotely = true;
        action.working_directory = std::env::temp_dir();
        let action = action.clone();

        let runner = DistributedRunner::new(
            PathBuf::from("kiln-no-such-coordinator"),
            PathBuf::from("distcc"),
            DistributedConfig::default(),
        );
        assert!(runner.run(&action).await.success());

        let strict = DistributedRunner::new(
            PathBuf::from("kiln-no-such-coordinator"),
            PathBuf::from("distcc"),
            DistributedConfig {
                local_fallback: false,
                ..DistributedConfig::default()
            },
        );
        assert!(!strict.run(&action).await.success());
    }
}
