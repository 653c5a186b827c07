//! Build core for C++ targets: unity grouping, the action graph and its
//! executors.
//!
//! A build goes through these stages:
//!
//! - [`unity::UnityAggregator`] groups a module's sources into unity files,
//!   keeping files in the [`working_set`] out so edits recompile quickly
//! - [`action_graph::ActionGraph`] links actions through the files they
//!   produce and consume and rejects cycles
//! - [`include_scan::IncludeScanner`] follows the `#include` directives of
//!   compile sources through the include caches
//! - [`outdated::OutdatedAnalysis`] picks the actions that have to run
//! - [`executor::select_executor`] chooses a backend and runs them
//!
//! [`session::BuildSession`] ties the stages together.
//!
//! # Example
//!
//! ```no_run
//! use kiln_build::{ActionGraph, BuildConfiguration, BuildSession, SystemHost};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn build() -> kiln_build::BuildResult<()> {
//! let config = BuildConfiguration::load_or_default(Path::new("kiln.yml"))?;
//! let graph = ActionGraph::load_json(Path::new("actions.json"))?;
//! let report = BuildSession::new(config, Arc::new(SystemHost)).run(graph).await?;
//! assert!(report.success());
//! # Ok(())
//! # }
//! ```

pub mod action_graph;
pub mod action_history;
pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod include_scan;
pub mod outdated;
pub mod session;
pub mod sources;
pub mod unity;
pub mod working_set;

pub use action_graph::{ActionGraph, ActionId, ActionKind, ActionSpec, BuildAction};
pub use action_history::ActionHistory;
pub use config::{BuildConfiguration, WorkingSetProvider};
pub use error::{BuildError, BuildResult};
pub use executor::{ActionExecutor, ExecutionSummary, select_executor};
pub use host::{ProcessHost, SystemHost};
pub use include_scan::IncludeScanner;
pub use outdated::OutdatedAnalysis;
pub use session::{BuildReport, BuildSession};
pub use sources::find_source_files;
pub use unity::{CompilationUnit, UnitKind, UnityAggregator, UnityPlan};
pub use working_set::WorkingSetOracle;
