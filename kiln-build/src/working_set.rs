//! Which source files the developer is currently editing.
//!
//! Files in the working set are compiled on their own instead of being merged
//! into unity units, so editing them does not rebuild their neighbours.

use crate::config::{WorkingSetConfig, WorkingSetProvider};
use kiln_cache::FileIdentity;
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a dropped query may take to exit after being asked to stop.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

pub trait WorkingSetOracle: Send + Sync {
    fn contains(&self, file: &FileIdentity) -> bool;
}

/// Nothing is being edited.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyWorkingSet;

impl WorkingSetOracle for EmptyWorkingSet {
    fn contains(&self, _file: &FileIdentity) -> bool {
        false
    }
}

/// Writable, non-generated files are being edited.
///
/// Suits checkouts where unmodified files are read-only until opened for
/// edit.
#[derive(Debug, Clone)]
pub struct ReadOnlyWorkingSet {
    generated_suffix: String,
}

impl ReadOnlyWorkingSet {
    pub fn new(generated_suffix: impl Into<String>) -> Self {
        Self {
            generated_suffix: generated_suffix.into(),
        }
    }
}

impl WorkingSetOracle for ReadOnlyWorkingSet {
    fn contains(&self, file: &FileIdentity) -> bool {
        if file.has_suffix(&self.generated_suffix) {
            return false;
        }
        std::fs::metadata(file.path()).is_ok_and(|meta| !meta.permissions().readonly())
    }
}

#[derive(Debug, Default)]
struct StatusSet {
    files: HashSet<FileIdentity>,
    /// Directory keys with a trailing `/`.
    directories: Vec<String>,
    errors: Vec<String>,
}

struct PendingQuery {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

/// Modified and untracked files reported by `git status`.
///
/// The query starts in the background on construction; the first call to
/// [`WorkingSetOracle::contains`] waits for it to finish.
pub struct GitWorkingSet {
    root: PathBuf,
    status: Arc<Mutex<StatusSet>>,
    pending: Mutex<Option<PendingQuery>>,
}

impl GitWorkingSet {
    /// Run `git status --porcelain` for the repository containing `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::spawn(dir.into(), "git", &["status", "--porcelain"], repository_top_level)
    }

    /// Run an arbitrary command producing porcelain status lines relative
    /// to `root`.
    pub fn with_command(root: impl Into<PathBuf>, program: &str, args: &[&str]) -> Self {
        Self::spawn(root.into(), program, args, Path::to_path_buf)
    }

    // `top_level` maps `root` to the directory status paths are relative
    // to. It runs on the reader thread.
    fn spawn(root: PathBuf, program: &str, args: &[&str], top_level: fn(&Path) -> PathBuf) -> Self {
        let status = Arc::new(Mutex::new(StatusSet::default()));

        let spawned = Command::new(program)
            .args(args)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let pending = match spawned {
            Ok(mut child) => {
                let mut readers = Vec::with_capacity(2);
                if let Some(stdout) = child.stdout.take() {
                    let status = Arc::clone(&status);
                    let dir = root.clone();
                    readers.push(std::thread::spawn(move || {
                        let root = top_level(&dir);
                        read_lines(stdout, |line| {
                            if let Some(entry) = parse_status_line(&line) {
                                record_entry(&status, &root, entry);
                            }
                        });
                    }));
                }
                if let Some(stderr) = child.stderr.take() {
                    let status = Arc::clone(&status);
                    readers.push(std::thread::spawn(move || {
                        read_lines(stderr, |line| {
                            lock(&status).errors.push(line);
                        });
                    }));
                }
                Some(PendingQuery { child, readers })
            }
            Err(e) => {
                warn!(
                    "Unable to query working set with {} in {}: {}",
                    program,
                    root.display(),
                    e
                );
                None
            }
        };

        Self {
            root,
            status,
            pending: Mutex::new(pending),
        }
    }

    fn wait(&self) {
        let Some(mut query) = lock(&self.pending).take() else {
            return;
        };

        let exit = query.child.wait();
        for reader in query.readers {
            let _ = reader.join();
        }

        let status = lock(&self.status);
        match exit {
            Ok(code) if code.success() => debug!(
                "Working set of {}: {} file(s), {} director(ies)",
                self.root.display(),
                status.files.len(),
                status.directories.len()
            ),
            Ok(code) => warn!(
                "Working set query in {} exited with {}: {}",
                self.root.display(),
                code,
                status.errors.join("\n")
            ),
            Err(e) => warn!("Working set query in {} failed: {}", self.root.display(), e),
        }
    }
}

impl WorkingSetOracle for GitWorkingSet {
    fn contains(&self, file: &FileIdentity) -> bool {
        self.wait();
        let status = lock(&self.status);
        status.files.contains(file)
            || status
                .directories
                .iter()
                .any(|dir| file.key().starts_with(dir.as_str()))
    }
}

impl Drop for GitWorkingSet {
    fn drop(&mut self) {
        let Some(mut query) = lock(&self.pending).take() else {
            return;
        };
        if !matches!(query.child.try_wait(), Ok(Some(_))) {
            terminate(&mut query.child);
        }
        for reader in query.readers {
            let _ = reader.join();
        }
    }
}

/// Ask `child` to exit, then kill it if it does not within the grace period.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }

    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    debug!("Killing working set query {}", child.id());
    let _ = child.kill();
    let _ = child.wait();
}

/// Porcelain paths are relative to the top level of the repository;
/// outside a repository `dir` itself is used.
fn repository_top_level(dir: &Path) -> PathBuf {
    Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(dir)
        .stderr(Stdio::null())
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| PathBuf::from(String::from_utf8_lossy(&out.stdout).trim()))
        .filter(|top| !top.as_os_str().is_empty())
        .unwrap_or_else(|| dir.to_path_buf())
}

/// Build the oracle selected by configuration.
pub fn from_config(config: &WorkingSetConfig, source_root: &Path) -> Box<dyn WorkingSetOracle> {
    match config.provider {
        WorkingSetProvider::None => Box::new(EmptyWorkingSet),
        WorkingSetProvider::Git => {
            let root = config.repository_root.as_deref().unwrap_or(source_root);
            Box::new(GitWorkingSet::new(root))
        }
        WorkingSetProvider::ReadOnly => {
            Box::new(ReadOnlyWorkingSet::new(config.generated_suffix.clone()))
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StatusEntry {
    File(String),
    Directory(String),
}

/// Parse one `XY path` porcelain line. Renames record the destination.
fn parse_status_line(line: &str) -> Option<StatusEntry> {
    let path = line.get(3..)?.trim_end();
    let path = path.rsplit_once(" -> ").map_or(path, |(_, to)| to);
    let path = path
        .strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    Some(match path.strip_suffix('/') {
        Some(dir) => StatusEntry::Directory(dir.to_string()),
        None => StatusEntry::File(path.to_string()),
    })
}

fn record_entry(status: &Mutex<StatusSet>, root: &Path, entry: StatusEntry) {
    let mut status = lock(status);
    match entry {
        StatusEntry::File(path) => {
            let _ = status.files.insert(FileIdentity::new(root.join(path)));
        }
        StatusEntry::Directory(path) => {
            let dir = FileIdentity::new(root.join(path));
            // Trailing separator so `src/a` does not match `src/ab.cpp`.
            status.directories.push(format!("{}/", dir.key()));
        }
    }
}

fn read_lines(stream: impl Read, mut on_line: impl FnMut(String)) {
    for line in BufReader::new(stream).lines() {
        match line {
            Ok(line) => on_line(line),
            Err(_) => break,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
