//! Run command: execute the outdated part of an action list

use super::CommandResult;
use kiln_build::executor::SshRemoteHost;
use kiln_build::{ActionGraph, BuildReport, BuildSession};
use std::path::Path;
use std::sync::Arc;

pub async fn execute(session: BuildSession, actions: &Path) -> CommandResult<BuildReport> {
    let graph = ActionGraph::load_json(actions)?;
    tracing::info!("Loaded {} action(s) from {}", graph.len(), actions.display());

    let session = match session.config().executor.remote.clone() {
        Some(remote) => {
            tracing::info!("Forwarding actions to {}", remote.host);
            session.with_remote(Arc::new(SshRemoteHost::new(remote)))
        }
        None => session,
    };

    let report = session.run(graph).await?;
    match report.executor {
        None => println!("Up to date ({} action(s))", report.total_actions),
        Some(executor) => println!(
            "{}/{} action(s) outdated, ran with the {} executor: {} completed, {} failed, {} skipped",
            report.outdated_actions,
            report.total_actions,
            executor,
            report.summary.completed(),
            report.summary.failed(),
            report.summary.skipped()
        ),
    }
    Ok(report)
}
