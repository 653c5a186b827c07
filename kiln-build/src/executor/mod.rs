//! Action execution backends
//!
//! Every backend drives the same [`Scheduler`] loop and differs only in how
//! one action is run and how many may run at once:
//! - local child processes
//! - a distributed compile coordinator
//! - an external build service fed with a script
//! - a remote build host reached over ssh

pub mod build_service;
pub mod distributed;
pub mod execution_log;
pub mod local;
pub mod remote_host;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use build_service::BuildServiceExecutor;
pub use distributed::{DISTRIBUTED_JOBS_ENV, DistributedExecutor, DistributedRunner};
pub use local::{LocalExecutor, LocalRunner, local_concurrency, run_process};
pub use remote_host::{RemoteHost, RemoteHostExecutor, RemoteRunner, SshRemoteHost};
pub use retry::{RetryPolicy, execute_with_retry, execute_with_retry_sync};
pub use scheduler::{ActionRunner, Scheduler};
pub use types::{
    ActionOutcome, ActionState, ExecutionRecord, ExecutionSummary, ExecutorError,
};

use crate::action_graph::BuildAction;
use crate::config::ExecutorConfig;
use crate::error::BuildResult;
use crate::host::ProcessHost;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// The backend chosen for one build.
pub enum ActionExecutor {
    Local(LocalExecutor),
    Distributed(DistributedExecutor),
    BuildService(BuildServiceExecutor),
    RemoteHost(RemoteHostExecutor),
}

impl ActionExecutor {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Distributed(_) => "distributed",
            Self::BuildService(_) => "build service",
            Self::RemoteHost(_) => "remote host",
        }
    }

    /// Run `actions` to completion.
    ///
    /// # Errors
    ///
    /// Only setup failures of the backend are errors; failed actions are
    /// reported in the summary.
    pub async fn execute(&self, actions: &[BuildAction]) -> BuildResult<ExecutionSummary> {
        info!("Executing {} action(s) with the {} executor", actions.len(), self.name());
        match self {
            Self::Local(executor) => Ok(executor.execute(actions).await),
            Self::Distributed(executor) => Ok(executor.execute(actions).await),
            Self::BuildService(executor) => executor.execute(actions).await,
            Self::RemoteHost(executor) => Ok(executor.execute(actions).await),
        }
    }
}

/// Pick the backend for this build.
///
/// A configured remote host wins. Otherwise the distributed and build
/// service backends are tried when allowed, and the local executor is the
/// fallback. `script_dir` receives the build service script.
pub async fn select_executor(
    config: &ExecutorConfig,
    host: &dyn ProcessHost,
    remote: Option<Arc<dyn RemoteHost>>,
    script_dir: &Path,
) -> ActionExecutor {
    if let Some(remote) = remote {
        return ActionExecutor::RemoteHost(RemoteHostExecutor::connect(remote, config, host).await);
    }

    if config.allow_distributed {
        match DistributedExecutor::probe(config, host) {
            Some(executor) => return ActionExecutor::Distributed(executor),
            None => warn!("Distributed build requested but unavailable, continuing without it"),
        }
    }

    if config.allow_build_service {
        match BuildServiceExecutor::probe(config, script_dir, host) {
            Some(executor) => return ActionExecutor::BuildService(executor),
            None => warn!("Build service requested but unavailable, continuing without it"),
        }
    }

    ActionExecutor::Local(LocalExecutor::from_config(config, host))
}
