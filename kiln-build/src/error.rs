//! Errors that abort a build.

use crate::action_graph::ActionId;
use crate::executor::ExecutorError;
use kiln_cache::CacheError;
use kiln_graph::GraphError;
use std::path::PathBuf;

/// Result type for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Fatal build errors.
///
/// Per-action failures are not errors: they are recorded in the execution
/// summary and the build continues with unrelated actions.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Failed to read {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid action list in {path}: {source}")]
    ActionParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Action graph contains a cycle!\n{0}")]
    CyclicActionGraph(String),

    #[error("{path} is produced by both action {first} and action {second}")]
    DuplicateProducer {
        path: PathBuf,
        first: ActionId,
        second: ActionId,
    },

    #[error("Failed to produce item: {0}")]
    MissingProducedItem(PathBuf),

    #[error("Required tool not found: {0}")]
    MissingTool(PathBuf),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl BuildError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
