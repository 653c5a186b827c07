//! Build actions and the dependencies between them.
//!
//! Actions name the files they read (prerequisites) and write (produced
//! items). [`ActionGraph::finalize`] derives the edges from those file sets:
//! an action depends on the producer of each of its prerequisites.

use crate::error::{BuildError, BuildResult};
use kiln_cache::{FileIdentity, FileRegistry};
use kiln_graph::{DAG, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How far down the graph dependents are counted when ordering actions.
const DEPENDENT_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(usize);

impl ActionId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Id of the action added `index`-th to its graph.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Compile,
    Link,
    /// Anything else: code generation, copies, resource compilers.
    Other,
}

/// One command that turns prerequisites into produced items.
#[derive(Debug, Clone)]
pub struct BuildAction {
    id: ActionId,
    pub kind: ActionKind,
    pub command_path: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    /// Shown in progress output. Defaults to the first produced file name.
    pub status_description: String,
    pub prerequisites: Vec<FileIdentity>,
    pub produced: Vec<FileIdentity>,
    pub can_execute_remotely: bool,
    pub can_execute_with_build_service: bool,
    /// Remove stale outputs before running, for tools that append.
    pub should_delete_produced_items: bool,
}

impl BuildAction {
    fn new(id: ActionId, kind: ActionKind) -> Self {
        Self {
            id,
            kind,
            command_path: PathBuf::new(),
            arguments: Vec::new(),
            working_directory: PathBuf::from("."),
            status_description: String::new(),
            prerequisites: Vec::new(),
            produced: Vec::new(),
            can_execute_remotely: false,
            can_execute_with_build_service: false,
            should_delete_produced_items: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Tool name without directories.
    #[must_use]
    pub fn tool_name(&self) -> String {
        self.command_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Full command line, used to detect changed build settings.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = quote(&self.command_path.to_string_lossy());
        for argument in &self.arguments {
            line.push(' ');
            line.push_str(&quote(argument));
        }
        line
    }

    /// Text for progress output.
    #[must_use]
    pub fn description(&self) -> String {
        if !self.status_description.is_empty() {
            return self.status_description.clone();
        }
        self.produced
            .first()
            .map_or_else(|| self.tool_name(), FileIdentity::file_name)
    }
}

fn quote(text: &str) -> String {
    if text.is_empty() || text.contains(char::is_whitespace) {
        format!("\"{text}\"")
    } else {
        text.to_string()
    }
}

/// Serialized form of an action, as read from an action list file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionSpec {
    pub kind: ActionKind,
    pub command: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub description: String,
    pub prerequisites: Vec<PathBuf>,
    pub produced: Vec<PathBuf>,
    pub remote: bool,
    pub build_service: bool,
    pub delete_produced_items: bool,
}

/// All actions of a build and their dependency edges.
#[derive(Debug, Default)]
pub struct ActionGraph {
    actions: Vec<BuildAction>,
    producers: HashMap<FileIdentity, ActionId>,
    dag: DAG<ActionId, FileIdentity>,
    order: Vec<ActionId>,
    finalized: bool,
}

impl ActionGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an action with a fresh id and return it for filling in.
    pub fn add(&mut self, kind: ActionKind) -> &mut BuildAction {
        let id = ActionId(self.actions.len());
        self.finalized = false;
        self.actions.push(BuildAction::new(id, kind));
        let index = self.actions.len() - 1;
        &mut self.actions[index]
    }

    /// Add an action described by `spec`. Relative paths resolve against
    /// `base_dir`.
    pub fn add_spec(&mut self, spec: ActionSpec, base_dir: &Path) -> ActionId {
        let resolve = |path: PathBuf| FileIdentity::new(base_dir.join(path));
        let action = self.add(spec.kind);
        action.command_path = spec.command;
        action.arguments = spec.arguments;
        action.working_directory = spec
            .working_directory
            .map_or_else(|| base_dir.to_path_buf(), |dir| base_dir.join(dir));
        action.status_description = spec.description;
        action.prerequisites = spec.prerequisites.into_iter().map(resolve).collect();
        action.produced = spec.produced.into_iter().map(resolve).collect();
        action.can_execute_remotely = spec.remote;
        action.can_execute_with_build_service = spec.build_service;
        action.should_delete_produced_items = spec.delete_produced_items;
        action.id
    }

    /// Read a JSON array of [`ActionSpec`]s.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `ActionParse` for
    /// malformed JSON.
    pub fn load_json(path: &Path) -> BuildResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        let specs: Vec<ActionSpec> =
            serde_json::from_str(&content).map_err(|source| BuildError::ActionParse {
                path: path.to_path_buf(),
                source,
            })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut graph = Self::new();
        for spec in specs {
            let _ = graph.add_spec(spec, &base_dir);
        }
        debug!("Loaded {} action(s) from {}", graph.len(), path.display());
        Ok(graph)
    }

    /// Link every prerequisite to its producer, reject cycles and compute the
    /// dispatch order.
    ///
    /// # Errors
    ///
    /// - `DuplicateProducer` if two actions produce the same file
    /// - `CyclicActionGraph` describing every action on a cycle
    pub fn finalize(&mut self) -> BuildResult<()> {
        self.producers.clear();
        for action in &self.actions {
            for item in &action.produced {
                if let Some(&first) = self.producers.get(item) {
                    if first != action.id {
                        return Err(BuildError::DuplicateProducer {
                            path: item.path().to_path_buf(),
                            first,
                            second: action.id,
                        });
                    }
                }
                let _ = self.producers.insert(item.clone(), action.id);
            }
        }

        let mut dag = DAG::new();
        for action in &self.actions {
            let _ = dag.add_node(action.id);
        }
        for action in &self.actions {
            for prerequisite in &action.prerequisites {
                if let Some(&producer) = self.producers.get(prerequisite) {
                    dag.link(node(producer), node(action.id), prerequisite.clone())?;
                }
            }
        }

        let cyclic = dag.unorderable_nodes();
        if !cyclic.is_empty() {
            return Err(BuildError::CyclicActionGraph(
                self.describe_cycle(&dag, &cyclic),
            ));
        }

        let mut weights = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            let dependents = dag.dependents_within(node(action.id), DEPENDENT_DEPTH)?;
            weights.push((dependents, action.prerequisites.len()));
        }
        let mut order: Vec<ActionId> = self.actions.iter().map(BuildAction::id).collect();
        order.sort_by(|a, b| weights[b.0].cmp(&weights[a.0]).then(a.cmp(b)));

        self.dag = dag;
        self.order = order;
        self.finalized = true;
        info!(
            "Action graph: {} action(s), {} dependency edge(s)",
            self.actions.len(),
            self.dag.edge_count()
        );
        Ok(())
    }

    fn describe_cycle(&self, dag: &DAG<ActionId, FileIdentity>, cyclic: &[NodeId]) -> String {
        let in_cycle: BTreeSet<usize> = cyclic.iter().map(|n| n.index()).collect();
        let mut text = String::new();
        for &index in &in_cycle {
            let action = &self.actions[index];
            let _ = writeln!(text, "\nAction {}: {}", action.id, action.command_path.display());
            let _ = writeln!(text, "\twith arguments: {}", action.arguments.join(" "));
            for prerequisite in &action.prerequisites {
                let _ = writeln!(text, "\tdepends on: {}", prerequisite);
            }
            for item in &action.produced {
                let _ = writeln!(text, "\tproduces:   {}", item);
            }
            let cyclic_inputs: Vec<String> = dag
                .dependencies(node(action.id))
                .unwrap_or_default()
                .into_iter()
                .filter(|dep| in_cycle.contains(&dep.index()))
                .filter_map(|dep| dag.edge(dep, node(action.id)))
                .map(ToString::to_string)
                .collect();
            let _ = writeln!(text, "\tcyclic prerequisites: {}", cyclic_inputs.join(", "));
        }
        text
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    #[must_use]
    pub fn action(&self, id: ActionId) -> Option<&BuildAction> {
        self.actions.get(id.0)
    }

    #[must_use]
    pub fn actions(&self) -> &[BuildAction] {
        &self.actions
    }

    /// Actions in dispatch order: most dependents first. Insertion order
    /// before [`ActionGraph::finalize`].
    pub fn sorted_actions(&self) -> impl Iterator<Item = &BuildAction> {
        let order: Box<dyn Iterator<Item = ActionId> + '_> = if self.finalized {
            Box::new(self.order.iter().copied())
        } else {
            Box::new(self.actions.iter().map(BuildAction::id))
        };
        order.filter_map(|id| self.action(id))
    }

    #[must_use]
    pub fn producer_of(&self, item: &FileIdentity) -> Option<ActionId> {
        self.producers.get(item).copied()
    }

    /// Actions that directly produce a prerequisite of `id`.
    #[must_use]
    pub fn prerequisite_actions(&self, id: ActionId) -> Vec<ActionId> {
        self.dag
            .dependencies(node(id))
            .unwrap_or_default()
            .into_iter()
            .map(|n| ActionId(n.index()))
            .collect()
    }

    /// The producer of `item` and everything it transitively depends on.
    #[must_use]
    pub fn gather_prerequisite_actions(&self, item: &FileIdentity) -> BTreeSet<ActionId> {
        let Some(producer) = self.producer_of(item) else {
            return BTreeSet::new();
        };
        let mut gathered: BTreeSet<ActionId> = self
            .dag
            .ancestors(node(producer))
            .unwrap_or_default()
            .into_iter()
            .map(|n| ActionId(n.index()))
            .collect();
        let _ = gathered.insert(producer);
        gathered
    }

    /// Clones of `ids` in dispatch order, ready to hand to an executor.
    #[must_use]
    pub fn batch(&self, ids: &BTreeSet<ActionId>) -> Vec<BuildAction> {
        self.sorted_actions()
            .filter(|action| ids.contains(&action.id))
            .cloned()
            .collect()
    }

    /// Make sure the directory of every item produced by `ids` exists.
    ///
    /// # Errors
    ///
    /// Returns `Io` for the first directory that cannot be created.
    pub fn create_directories_for_produced_items(
        &self,
        ids: &BTreeSet<ActionId>,
    ) -> BuildResult<()> {
        let directories: BTreeSet<&Path> = ids
            .iter()
            .filter_map(|&id| self.action(id))
            .flat_map(|action| action.produced.iter())
            .filter_map(|item| item.path().parent())
            .collect();
        for directory in directories {
            std::fs::create_dir_all(directory).map_err(|e| BuildError::io(directory, e))?;
        }
        Ok(())
    }

    /// Delete existing outputs of outdated actions that ask for it.
    ///
    /// # Errors
    ///
    /// Returns `Io` if an existing file cannot be removed.
    pub fn delete_outdated_produced_items(
        &self,
        outdated: &BTreeSet<ActionId>,
        registry: &FileRegistry,
    ) -> BuildResult<()> {
        for action in outdated.iter().filter_map(|&id| self.action(id)) {
            if !action.should_delete_produced_items {
                continue;
            }
            for identity in &action.produced {
                let item = registry.item_for(identity);
                if item.exists() {
                    debug!("Deleting outdated item: {}", identity);
                    std::fs::remove_file(item.path()).map_err(|e| BuildError::io(item.path(), e))?;
                    item.reset_file_info();
                }
            }
        }
        Ok(())
    }

    /// Check that every link action in `completed` left its outputs behind.
    ///
    /// # Errors
    ///
    /// Returns `MissingProducedItem` for the first missing output.
    pub fn verify_link_outputs(
        &self,
        completed: impl IntoIterator<Item = ActionId>,
        registry: &FileRegistry,
    ) -> BuildResult<()> {
        for action in completed.into_iter().filter_map(|id| self.action(id)) {
            if action.kind != ActionKind::Link {
                continue;
            }
            for identity in &action.produced {
                let item = registry.item_for(identity);
                item.reset_file_info();
                if !item.exists() {
                    return Err(BuildError::MissingProducedItem(item.path().to_path_buf()));
                }
            }
        }
        Ok(())
    }
}

fn node(id: ActionId) -> NodeId {
    NodeId::from_index(id.0)
}
