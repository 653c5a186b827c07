//! Build configuration loaded from `kiln.yml`.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working configuration:
//!
//! ```yaml
//! target:
//!   name: Editor
//!   output_dir: Intermediate
//! unity:
//!   split_bytes: 393216
//! working_set:
//!   provider: git
//! executor:
//!   allow_distributed: true
//!   distributed:
//!     hosts_info: /var/dmucs/hosts-info
//! ```

use crate::error::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root of `kiln.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfiguration {
    pub target: TargetConfig,
    pub unity: UnityConfig,
    pub working_set: WorkingSetConfig,
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
}

impl BuildConfiguration {
    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigRead` when the file cannot be read and `ConfigParse`
    /// when it is not valid YAML for this schema.
    pub fn load(path: &Path) -> BuildResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| BuildError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| BuildError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse a configuration from YAML text. Empty text gives the defaults.
    ///
    /// # Errors
    ///
    /// Returns the YAML error for malformed input.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Load `path` if it exists, otherwise use the defaults.
    ///
    /// # Errors
    ///
    /// Same as [`BuildConfiguration::load`] for an existing file.
    pub fn load_or_default(path: &Path) -> BuildResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// What is being built and where intermediates go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub name: String,
    pub output_dir: PathBuf,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: "Default".to_string(),
            output_dir: PathBuf::from("Intermediate"),
        }
    }
}

impl TargetConfig {
    /// Location of the include resolution cache.
    #[must_use]
    pub fn include_cache_path(&self) -> PathBuf {
        self.output_dir.join("DependencyCache.bin")
    }

    /// Location of the flattened include cache.
    #[must_use]
    pub fn flattened_cache_path(&self) -> PathBuf {
        self.output_dir.join("FlattenedIncludes.bin")
    }

    /// Location of the action history.
    #[must_use]
    pub fn action_history_path(&self) -> PathBuf {
        self.output_dir.join("ActionHistory.bin")
    }
}

/// Unity build settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnityConfig {
    /// Virtual size after which a unit is closed.
    pub split_bytes: u64,
    /// Compile working-set files on their own.
    pub adaptive: bool,
    /// Whether the module uses a precompiled header.
    pub use_pch: bool,
    /// Write `#include` paths relative to the module directory.
    pub relative_includes: bool,
    /// File name suffixes that are never merged.
    pub standalone_suffixes: Vec<String>,
}

impl Default for UnityConfig {
    fn default() -> Self {
        Self {
            split_bytes: 384 * 1024,
            adaptive: true,
            use_pch: true,
            relative_includes: false,
            standalone_suffixes: vec![".init.gen.cpp".to_string()],
        }
    }
}

/// Source of working-set membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkingSetProvider {
    None,
    #[default]
    Git,
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingSetConfig {
    pub provider: WorkingSetProvider,
    /// Repository root for the git provider. Defaults to the source directory.
    pub repository_root: Option<PathBuf>,
    /// Suffix of generated sources, never part of the read-only working set.
    pub generated_suffix: String,
}

impl Default for WorkingSetConfig {
    fn default() -> Self {
        Self {
            provider: WorkingSetProvider::default(),
            repository_root: None,
            generated_suffix: ".gen.cpp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Fail when an include token resolves differently than before.
    pub test_resolve_conflicts: bool,
}

/// Executor selection and tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub allow_distributed: bool,
    pub allow_build_service: bool,
    /// Local concurrency per logical processor.
    pub processor_multiplier: f64,
    /// Hard cap on local concurrency; 0 means derive it from the processor count.
    pub max_local_actions: usize,
    pub poll_interval_ms: u64,
    pub log_detailed_action_stats: bool,
    pub distributed: DistributedConfig,
    pub build_service: BuildServiceConfig,
    pub remote: Option<RemoteConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allow_distributed: false,
            allow_build_service: false,
            processor_multiplier: 1.0,
            max_local_actions: 0,
            poll_interval_ms: 10,
            log_detailed_action_stats: false,
            distributed: DistributedConfig::default(),
            build_service: BuildServiceConfig::default(),
            remote: None,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Coordinator-based distributed compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Command that leases a remote slot and runs the dispatcher.
    pub coordinator: PathBuf,
    pub coordinator_host: String,
    /// Compiler wrapper run under the coordinator.
    pub dispatcher: PathBuf,
    /// Manifest listing build hosts and their CPU counts.
    pub hosts_info: PathBuf,
    /// Retry a failed dispatch on the local machine.
    pub local_fallback: bool,
    /// Appended to every dispatched compile.
    pub extra_compile_flags: Vec<String>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            coordinator: PathBuf::from("gethost"),
            coordinator_host: "localhost".to_string(),
            dispatcher: PathBuf::from("distcc"),
            hosts_info: PathBuf::from("/var/dmucs/hosts-info"),
            local_fallback: true,
            extra_compile_flags: vec![
                "-Wno-parentheses-equality".to_string(),
                "-Wno-unused-value".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildServiceConfig {
    /// Environment variable holding the service SDK root.
    pub root_env: String,
    /// Service executable, relative to the SDK root.
    pub executable: PathBuf,
    /// Name of the agent process that must be running.
    pub agent_process: String,
    /// Script file name, written to the target output directory.
    pub script_name: String,
}

impl Default for BuildServiceConfig {
    fn default() -> Self {
        Self {
            root_env: "KILN_BUILD_SERVICE_ROOT".to_string(),
            executable: PathBuf::from("bin/dbsbuild"),
            agent_process: "dbsagent".to_string(),
            script_name: "BuildServiceScript.txt".to_string(),
        }
    }
}

/// A remote build host reached over ssh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub ssh: PathBuf,
    pub max_attempts: usize,
    pub backoff_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            port: 22,
            ssh: PathBuf::from("ssh"),
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_text_gives_defaults() {
        let config = BuildConfiguration::from_yaml("").unwrap();
        assert_eq!(config, BuildConfiguration::default());
        assert_eq!(config.unity.split_bytes, 393_216);
        assert_eq!(config.executor.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = BuildConfiguration::from_yaml(
            r"
target:
  name: Editor
working_set:
  provider: readonly
executor:
  max_local_actions: 4
  distributed:
    local_fallback: false
  remote:
    host: mac-builder
    user: build
",
        )
        .unwrap();

        assert_eq!(config.target.name, "Editor");
        assert_eq!(config.target.output_dir, PathBuf::from("Intermediate"));
        assert_eq!(config.working_set.provider, WorkingSetProvider::ReadOnly);
        assert_eq!(config.executor.max_local_actions, 4);
        assert!(!config.executor.distributed.local_fallback);
        assert_eq!(config.executor.distributed.dispatcher, PathBuf::from("distcc"));

        let remote = config.executor.remote.unwrap();
        assert_eq!(remote.host, "mac-builder");
        assert_eq!(remote.port, 22);
        assert_eq!(remote.max_attempts, 3);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(BuildConfiguration::from_yaml("working_set: { provider: svn }").is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kiln.yml");
        std::fs::write(&path, "unity: [not, a, map]").unwrap();

        let err = BuildConfiguration::load(&path).unwrap_err();
        assert!(matches!(err, BuildError::ConfigParse { .. }));
        assert!(err.to_string().contains("kiln.yml"));

        let missing = BuildConfiguration::load_or_default(&tmp.path().join("absent.yml")).unwrap();
        assert_eq!(missing, BuildConfiguration::default());
    }
}
