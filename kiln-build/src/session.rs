//! One build from action list to verified outputs.

use crate::action_graph::{ActionGraph, ActionId};
use crate::action_history::ActionHistory;
use crate::config::BuildConfiguration;
use crate::error::{BuildError, BuildResult};
use crate::executor::{ExecutionSummary, RemoteHost, select_executor};
use crate::host::{ProcessHost, find_executable};
use crate::include_scan::IncludeScanner;
use crate::outdated::OutdatedAnalysis;
use crate::unity::{UnityAggregator, UnityPlan, forget_absorbed_files};
use crate::working_set;
use kiln_cache::{
    FileRegistry, FlattenedIncludeCache, IncludeResolutionCache, RemoteFileInfo,
    RemoteFingerprintBridge,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a finished build did.
#[derive(Debug)]
pub struct BuildReport {
    pub total_actions: usize,
    pub outdated_actions: usize,
    /// `None` when everything was up to date.
    pub executor: Option<&'static str>,
    pub summary: ExecutionSummary,
}

impl BuildReport {
    #[must_use]
    pub fn success(&self) -> bool {
        self.summary.success()
    }
}

pub struct BuildSession {
    config: BuildConfiguration,
    registry: Arc<FileRegistry>,
    host: Arc<dyn ProcessHost>,
    remote: Option<Arc<dyn RemoteHost>>,
    bridge: Option<Arc<RemoteFingerprintBridge>>,
}

impl BuildSession {
    pub fn new(config: BuildConfiguration, host: Arc<dyn ProcessHost>) -> Self {
        Self {
            config,
            registry: Arc::new(FileRegistry::new()),
            host,
            remote: None,
            bridge: None,
        }
    }

    /// Run every action on `remote` instead of this machine.
    ///
    /// Produced items then live on the remote host too and are stat'ed there
    /// in batches.
    #[must_use]
    pub fn with_remote<H: RemoteHost + 'static>(mut self, remote: Arc<H>) -> Self {
        let info: Arc<dyn RemoteFileInfo> = remote.clone();
        let host: Arc<dyn RemoteHost> = remote;
        self.bridge = Some(Arc::new(RemoteFingerprintBridge::new(info)));
        self.remote = Some(host);
        self
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfiguration {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    /// Plan the unity units of `module` and write them to `module_dir`.
    ///
    /// Files absorbed into unity units lose their flattened-include entries,
    /// since they are no longer compiled on their own.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a unit cannot be written.
    pub fn generate_unity(
        &self,
        module: &str,
        source_root: &Path,
        files: &[PathBuf],
        module_dir: &Path,
    ) -> BuildResult<UnityPlan> {
        let items: Vec<_> = files.iter().map(|file| self.registry.item(file)).collect();
        let oracle = working_set::from_config(&self.config.working_set, source_root);
        let aggregator = UnityAggregator::new(&self.config.unity, oracle.as_ref());

        let plan = aggregator.plan(module, module_dir, &items);
        let written = aggregator.write_units(&plan, module_dir)?;
        info!(
            "Module {}: {} unit(s), {} rewritten",
            module,
            plan.units.len(),
            written.len()
        );

        let mut flattened = FlattenedIncludeCache::load(
            self.config.target.flattened_cache_path(),
            Arc::clone(&self.registry),
        );
        let forgotten = forget_absorbed_files(&plan, &mut flattened);
        if forgotten > 0 {
            debug!("Dropped flattened includes of {} absorbed file(s)", forgotten);
        }
        flattened.save();
        Ok(plan)
    }

    /// Run the outdated part of `graph`.
    ///
    /// # Errors
    ///
    /// Fatal graph problems (cycles, duplicate producers), conflicting
    /// include resolutions, tools that cannot be found, IO failures while
    /// preparing outputs and link outputs missing after a successful run.
    /// Failed actions are not errors; see [`BuildReport::success`].
    pub async fn run(&self, mut graph: ActionGraph) -> BuildResult<BuildReport> {
        graph.finalize()?;
        if let Some(bridge) = &self.bridge {
            for action in graph.actions() {
                for item in &action.produced {
                    let _ = self.registry.remote_item(item.path(), bridge);
                }
            }
        }
        self.resolve_remote_fingerprints().await;
        let target = &self.config.target;
        let mut history = ActionHistory::load(target.action_history_path());
        let mut flattened =
            FlattenedIncludeCache::load(target.flattened_cache_path(), Arc::clone(&self.registry));
        let check_conflicts = self.config.cache.test_resolve_conflicts;
        let mut includes =
            IncludeResolutionCache::load(target.include_cache_path(), Arc::clone(&self.registry))
                .with_conflict_checking(check_conflicts);
        let scanned = IncludeScanner::new(&mut includes, &self.registry)
            .verify_resolved(check_conflicts)
            .scan_actions(graph.actions(), &mut flattened)?;
        debug!("Scanned the includes of {} source file(s)", scanned);

        let outdated = OutdatedAnalysis::new(&graph, &self.registry)
            .with_history(&history)
            .with_flattened_includes(&flattened)
            .outdated_actions();
        if outdated.is_empty() {
            info!("Target {} is up to date", target.name);
            history.save();
            includes.save();
            flattened.save();
            return Ok(BuildReport {
                total_actions: graph.len(),
                outdated_actions: 0,
                executor: None,
                summary: ExecutionSummary::default(),
            });
        }

        if let Err(e) = self.check_tools(&graph, &outdated) {
            history.save();
            includes.save();
            flattened.save();
            return Err(e);
        }
        graph.delete_outdated_produced_items(&outdated, &self.registry)?;
        graph.create_directories_for_produced_items(&outdated)?;
        let batch = graph.batch(&outdated);

        let executor = select_executor(
            &self.config.executor,
            self.host.as_ref(),
            self.remote.clone(),
            &target.output_dir,
        )
        .await;
        let summary = executor.execute(&batch).await?;

        for action in summary
            .completed_actions()
            .filter_map(|id| graph.action(id))
        {
            for item in &action.produced {
                self.registry.item_for(item).reset_file_info();
            }
            history.record_action(action);
        }
        history.save();
        includes.save();
        flattened.save();

        info!("{}", summary.format());
        if summary.success() {
            self.resolve_remote_fingerprints().await;
            graph.verify_link_outputs(summary.completed_actions(), &self.registry)?;
        }

        Ok(BuildReport {
            total_actions: graph.len(),
            outdated_actions: outdated.len(),
            executor: Some(executor.name()),
            summary,
        })
    }

    // Remote stats block on ssh, so they run on the blocking pool before any
    // fingerprint of a remote item is read.
    async fn resolve_remote_fingerprints(&self) {
        let Some(bridge) = self.bridge.clone() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || bridge.resolve_pending()).await {
            warn!("Remote fingerprint lookup did not finish: {}", e);
        }
    }

    // Remote hosts bring their own toolchain.
    fn check_tools(&self, graph: &ActionGraph, outdated: &BTreeSet<ActionId>) -> BuildResult<()> {
        if self.remote.is_some() {
            return Ok(());
        }
        for action in outdated.iter().filter_map(|id| graph.action(*id)) {
            let tool = if action.command_path.is_relative()
                && action.command_path.components().count() > 1
            {
                action.working_directory.join(&action.command_path)
            } else {
                action.command_path.clone()
            };
            if find_executable(&tool, self.host.as_ref()).is_none() {
                error!("{}: cannot find {}", action.description(), tool.display());
                return Err(BuildError::MissingTool(action.command_path.clone()));
            }
        }
        Ok(())
    }
}
