//! Forwarding actions to a remote build host over ssh.

use super::local::run_process;
use super::retry::{RetryPolicy, execute_with_retry, execute_with_retry_sync};
use super::scheduler::{ActionRunner, Scheduler};
use super::types::{ActionOutcome, ExecutionSummary, ExecutorError};
use crate::action_graph::BuildAction;
use crate::config::{ExecutorConfig, RemoteConfig};
use crate::host::ProcessHost;
use async_trait::async_trait;
use filetime::FileTime;
use kiln_cache::{CacheError, CacheResult, FileIdentity, RemoteFileInfo, RemoteFileStat};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A machine that runs commands and reports file metadata for a build.
#[async_trait]
pub trait RemoteHost: RemoteFileInfo {
    fn name(&self) -> &str;

    /// Run `executable` with `arguments` in `working_directory` on the host.
    ///
    /// # Errors
    ///
    /// `ExecutorError::Transport` when the host could not be reached; the
    /// command's own failures are reported through the outcome.
    async fn command(
        &self,
        working_directory: &Path,
        executable: &Path,
        arguments: &[String],
    ) -> Result<ActionOutcome, ExecutorError>;

    /// How many commands the host is willing to run at once.
    async fn available_command_slots(&self) -> Result<usize, ExecutorError>;
}

/// ssh exits with this status when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Quote `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+,:@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub struct SshRemoteHost {
    config: RemoteConfig,
    policy: RetryPolicy,
}

impl SshRemoteHost {
    #[must_use]
    pub fn new(config: RemoteConfig) -> Self {
        let policy = RetryPolicy::from_remote_config(&config);
        Self { config, policy }
    }

    fn destination(&self) -> String {
        if self.config.user.is_empty() {
            self.config.host.clone()
        } else {
            format!("{}@{}", self.config.user, self.config.host)
        }
    }

    /// Arguments to `ssh` running `remote_command` on the host.
    #[must_use]
    pub fn ssh_arguments(&self, remote_command: &str) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            self.destination(),
            remote_command.to_string(),
        ]
    }

    async fn ssh(&self, remote_command: &str) -> Result<ActionOutcome, ExecutorError> {
        let outcome = run_process(
            &self.config.ssh,
            &self.ssh_arguments(remote_command),
            Path::new("."),
        )
        .await?;
        if outcome.exit_code == SSH_CONNECTION_FAILURE {
            return Err(ExecutorError::Transport(format!(
                "{}: {}",
                self.config.host,
                outcome.output.trim()
            )));
        }
        Ok(outcome)
    }

    fn stat_command(files: &[FileIdentity]) -> String {
        let mut command = String::from("stat -c '%s %Y %n' --");
        for file in files {
            command.push(' ');
            command.push_str(&shell_quote(&file.path().to_string_lossy()));
        }
        command.push_str(" 2>/dev/null");
        command
    }
}

/// Parse `<size> <mtime> <path>` lines from the host's `stat`.
///
/// Files the host did not mention are reported as missing.
#[must_use]
pub fn parse_stat_output(output: &str, files: &[FileIdentity]) -> Vec<RemoteFileStat> {
    let mut found: HashMap<FileIdentity, (u64, i64)> = HashMap::new();
    for line in output.lines() {
        let mut fields = line.splitn(3, ' ');
        let (Some(size), Some(mtime), Some(path)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if let (Ok(size), Ok(mtime)) = (size.parse(), mtime.parse()) {
            let _ = found.insert(FileIdentity::new(path), (size, mtime));
        }
    }

    files
        .iter()
        .map(|identity| match found.get(identity) {
            Some(&(length, mtime)) => RemoteFileStat {
                identity: identity.clone(),
                exists: true,
                length,
                last_write: Some(FileTime::from_unix_time(mtime, 0)),
            },
            None => RemoteFileStat {
                identity: identity.clone(),
                exists: false,
                length: 0,
                last_write: None,
            },
        })
        .collect()
}

impl RemoteFileInfo for SshRemoteHost {
    fn batch_fingerprint(&self, files: &[FileIdentity]) -> CacheResult<Vec<RemoteFileStat>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let remote_command = Self::stat_command(files);
        debug!("Stat {} file(s) on {}", files.len(), self.config.host);
        let output = execute_with_retry_sync(&self.policy, "remote stat", || {
            let output = std::process::Command::new(&self.config.ssh)
                .args(self.ssh_arguments(&remote_command))
                .stdin(std::process::Stdio::null())
                .output()
                .map_err(|source| ExecutorError::Spawn {
                    command: self.config.ssh.clone(),
                    source,
                })?;
            if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
                return Err(ExecutorError::Transport(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
        .map_err(|e| CacheError::Remote {
            reason: e.to_string(),
        })?;
        Ok(parse_stat_output(&output, files))
    }
}

#[async_trait]
impl RemoteHost for SshRemoteHost {
    fn name(&self) -> &str {
        &self.config.host
    }

    async fn command(
        &self,
        working_directory: &Path,
        executable: &Path,
        arguments: &[String],
    ) -> Result<ActionOutcome, ExecutorError> {
        let mut remote_command = format!(
            "cd {} && {}",
            shell_quote(&working_directory.to_string_lossy()),
            shell_quote(&executable.to_string_lossy())
        );
        for argument in arguments {
            remote_command.push(' ');
            remote_command.push_str(&shell_quote(argument));
        }
        self.ssh(&remote_command).await
    }

    async fn available_command_slots(&self) -> Result<usize, ExecutorError> {
        let outcome = self
            .ssh("getconf _NPROCESSORS_ONLN 2>/dev/null || sysctl -n hw.ncpu")
            .await?;
        outcome
            .output
            .trim()
            .parse::<usize>()
            .map_err(|_| {
                ExecutorError::BackendUnavailable(format!(
                    "{} reported no processor count: {}",
                    self.config.host,
                    outcome.output.trim()
                ))
            })
    }
}

/// Forwards every action to a [`RemoteHost`], retrying transport failures.
pub struct RemoteRunner {
    host: Arc<dyn RemoteHost>,
    policy: RetryPolicy,
}

impl RemoteRunner {
    #[must_use]
    pub fn new(host: Arc<dyn RemoteHost>, policy: RetryPolicy) -> Self {
        Self { host, policy }
    }
}

#[async_trait]
impl ActionRunner for RemoteRunner {
    async fn run(&self, action: &BuildAction) -> ActionOutcome {
        let description = action.description();
        execute_with_retry(&self.policy, &description, || {
            self.host.command(
                &action.working_directory,
                &action.command_path,
                &action.arguments,
            )
        })
        .await
        .unwrap_or_else(|e| ActionOutcome::not_started(&e))
    }
}

pub struct RemoteHostExecutor {
    scheduler: Scheduler,
    runner: Arc<RemoteRunner>,
}

impl RemoteHostExecutor {
    /// Ask `remote` for its command slots once and size the scheduler by
    /// them, falling back to the local processor count.
    pub async fn connect(
        remote: Arc<dyn RemoteHost>,
        config: &ExecutorConfig,
        host: &dyn ProcessHost,
    ) -> Self {
        let slots = match remote.available_command_slots().await {
            Ok(slots) if slots > 0 => slots,
            Ok(_) => host.processor_count().max(1),
            Err(e) => {
                warn!(
                    "Could not query command slots on {}: {}, using local processor count",
                    remote.name(),
                    e
                );
                host.processor_count().max(1)
            }
        };
        info!("Remote build on {} with up to {} action(s)", remote.name(), slots);

        let policy = config
            .remote
            .as_ref()
            .map_or_else(RetryPolicy::default, RetryPolicy::from_remote_config);
        Self {
            scheduler: Scheduler::new(slots)
                .with_poll_interval(config.poll_interval())
                .with_detailed_stats(config.log_detailed_action_stats),
            runner: Arc::new(RemoteRunner::new(remote, policy)),
        }
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
