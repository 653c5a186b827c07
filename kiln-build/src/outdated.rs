//! Deciding which actions have to run.

use crate::action_graph::{ActionGraph, ActionId, ActionKind, BuildAction};
use crate::action_history::ActionHistory;
use filetime::FileTime;
use kiln_cache::{FileRegistry, FlattenedIncludeCache};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Inputs newer than the outputs by less than this are not considered
/// changed; file systems round timestamps differently.
const TIMESTAMP_SLOP_NANOS: i128 = 1_000_000_000;

/// Produced items whose timestamps say nothing about freshness. Linkers
/// leave import libraries and debug databases untouched when unchanged.
const IGNORED_TIMESTAMP_SUFFIXES: [&str; 3] = [".lib", ".exp", ".pdb"];

/// Outdatedness check over a finalized [`ActionGraph`].
pub struct OutdatedAnalysis<'a> {
    graph: &'a ActionGraph,
    registry: &'a FileRegistry,
    history: Option<&'a ActionHistory>,
    flattened: Option<&'a FlattenedIncludeCache>,
}

impl<'a> OutdatedAnalysis<'a> {
    pub fn new(graph: &'a ActionGraph, registry: &'a FileRegistry) -> Self {
        Self {
            graph,
            registry,
            history: None,
            flattened: None,
        }
    }

    /// Treat changed command lines as outdated.
    #[must_use]
    pub fn with_history(mut self, history: &'a ActionHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Check the transitive includes of compile prerequisites too.
    #[must_use]
    pub fn with_flattened_includes(mut self, flattened: &'a FlattenedIncludeCache) -> Self {
        self.flattened = Some(flattened);
        self
    }

    /// Every action that has to run.
    #[must_use]
    pub fn outdated_actions(&self) -> BTreeSet<ActionId> {
        let mut memo = HashMap::new();
        let outdated: BTreeSet<ActionId> = self
            .graph
            .actions()
            .iter()
            .filter(|action| self.is_outdated(action, &mut memo))
            .map(BuildAction::id)
            .collect();
        debug!(
            "{} of {} action(s) are outdated",
            outdated.len(),
            self.graph.len()
        );
        outdated
    }

    fn is_outdated(&self, action: &BuildAction, memo: &mut HashMap<ActionId, bool>) -> bool {
        if let Some(&known) = memo.get(&action.id()) {
            return known;
        }
        let outdated = self.check(action, memo);
        let _ = memo.insert(action.id(), outdated);
        outdated
    }

    fn check(&self, action: &BuildAction, memo: &mut HashMap<ActionId, bool>) -> bool {
        let mut oldest_output: Option<i128> = None;
        for identity in &action.produced {
            let item = self.registry.item_for(identity);
            if !item.exists() || item.length() == 0 {
                debug!("{}: produced item {} is missing", action.description(), identity);
                return true;
            }
            if IGNORED_TIMESTAMP_SUFFIXES
                .iter()
                .any(|suffix| identity.has_suffix(suffix))
            {
                continue;
            }
            if let Some(written) = item.last_write().map(nanos) {
                oldest_output = Some(oldest_output.map_or(written, |old| old.min(written)));
            }
        }

        if let Some(history) = self.history {
            let command_line = action.command_line();
            if let Some(item) = action
                .produced
                .iter()
                .find(|item| history.is_command_line_changed(item, &command_line))
            {
                debug!("{}: {} was produced by a different command line", action.description(), item);
                return true;
            }
        }

        for prerequisite in &action.prerequisites {
            if let Some(producer) = self.graph.producer_of(prerequisite)
                && producer != action.id()
                && let Some(producing) = self.graph.action(producer)
                && self.is_outdated(producing, memo)
            {
                debug!(
                    "{}: {} is produced by an outdated action",
                    action.description(),
                    prerequisite
                );
                return true;
            }

            let Some(oldest) = oldest_output else {
                continue;
            };
            let item = self.registry.item_for(prerequisite);
            if is_newer(item.last_write(), oldest) {
                debug!("{}: {} is newer than the outputs", action.description(), prerequisite);
                return true;
            }

            if action.kind == ActionKind::Compile
                && let Some(includes) = self
                    .flattened
                    .and_then(|flattened| flattened.get_dependencies_for_file(&item))
                && let Some(include) = includes
                    .iter()
                    .find(|include| is_newer(include.last_write(), oldest))
            {
                debug!(
                    "{}: included file {} is newer than the outputs",
                    action.description(),
                    include.identity()
                );
                return true;
            }
        }
        false
    }
}

fn nanos(time: FileTime) -> i128 {
    i128::from(time.unix_seconds()) * 1_000_000_000 + i128::from(time.nanoseconds())
}

fn is_newer(written: Option<FileTime>, oldest_output: i128) -> bool {
    written.is_some_and(|time| nanos(time) > oldest_output + TIMESTAMP_SLOP_NANOS)
}
