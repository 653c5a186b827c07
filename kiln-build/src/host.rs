//! Queries about the machine the build runs on.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// The local machine, as seen by executor selection and scheduling.
pub trait ProcessHost: Send + Sync {
    /// Logical processors available for actions.
    fn processor_count(&self) -> usize;

    /// Whether a process with exactly this name is running.
    fn is_process_running(&self, name: &str) -> bool;

    fn env_var(&self, name: &str) -> Option<String>;
}

/// The real machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl ProcessHost for SystemHost {
    fn processor_count(&self) -> usize {
        num_cpus::get()
    }

    fn is_process_running(&self, name: &str) -> bool {
        let probe = if cfg!(windows) {
            Command::new("tasklist")
                .args(["/NH", "/FI", &format!("IMAGENAME eq {name}.exe")])
                .stderr(Stdio::null())
                .output()
                .map(|out| String::from_utf8_lossy(&out.stdout).contains(name))
        } else {
            Command::new("pgrep")
                .args(["-x", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
        };

        probe.unwrap_or_else(|e| {
            debug!("Could not query running processes: {}", e);
            false
        })
    }

    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|value| !value.is_empty())
    }
}

/// Resolve a tool the way a shell would.
///
/// Paths with a directory component are checked as given; bare names are
/// looked up on the host's `PATH`.
pub fn find_executable(tool: &Path, host: &dyn ProcessHost) -> Option<PathBuf> {
    if tool.components().count() > 1 || tool.is_absolute() {
        return tool.is_file().then(|| tool.to_path_buf());
    }

    let search = host.env_var("PATH")?;
    std::env::split_paths(&search)
        .flat_map(|dir| {
            let plain = dir.join(tool);
            let exe = cfg!(windows).then(|| dir.join(tool).with_extension("exe"));
            std::iter::once(plain).chain(exe)
        })
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ProcessHost;
    use std::collections::{HashMap, HashSet};

    /// Scripted host for executor tests.
    #[derive(Debug, Default)]
    pub(crate) struct FakeHost {
        pub processors: usize,
        pub running: HashSet<String>,
        pub env: HashMap<String, String>,
    }

    impl FakeHost {
        pub(crate) fn with_processors(processors: usize) -> Self {
            Self {
                processors,
                ..Self::default()
            }
        }
    }

    impl ProcessHost for FakeHost {
        fn processor_count(&self) -> usize {
            self.processors
        }

        fn is_process_running(&self, name: &str) -> bool {
            self.running.contains(name)
        }

        fn env_var(&self, name: &str) -> Option<String> {
            self.env.get(name).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeHost;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn system_host_reports_processors() {
        assert!(SystemHost.processor_count() >= 1);
    }

    #[test]
    fn bare_names_are_searched_on_path() {
        let tmp = TempDir::new().unwrap();
        let tool = tmp.path().join("distcc");
        std::fs::write(&tool, "").unwrap();

        let mut host = FakeHost::with_processors(1);
        let _ = host
            .env
            .insert("PATH".to_string(), tmp.path().display().to_string());

        assert_eq!(find_executable(Path::new("distcc"), &host), Some(tool.clone()));
        assert_eq!(find_executable(Path::new("gethost"), &host), None);
        assert_eq!(find_executable(&tool, &FakeHost::default()), Some(tool));
    }

    #[test]
    fn missing_path_finds_nothing() {
        assert_eq!(find_executable(Path::new("distcc"), &FakeHost::default()), None);
    }
}
