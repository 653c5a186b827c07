//! Normalized file identities.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Whether identities compare case-insensitively on this host.
pub const FOLD_CASE: bool = cfg!(any(windows, target_os = "macos"));

/// Normalized absolute path of a file.
///
/// Relative paths are resolved against the current directory and `.`/`..`
/// components are removed lexically. Two identities are equal when their
/// keys are equal; the key uses `/` separators and is lowercased on hosts
/// with case-insensitive file systems.
#[derive(Clone)]
pub struct FileIdentity {
    path: Arc<Path>,
    key: Arc<str>,
}

impl FileIdentity {
    /// Create an identity for `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let normalized = normalize(&absolute);

        let mut key = normalized.to_string_lossy().replace('\\', "/");
        if FOLD_CASE {
            key = key.to_lowercase();
        }

        Self {
            path: Arc::from(normalized.as_path()),
            key: Arc::from(key),
        }
    }

    /// Normalized absolute path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Comparison key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// File name component, or an empty string for a root path.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Case-insensitive check of the file name suffix, e.g. `".gen.cpp"`.
    #[must_use]
    pub fn has_suffix(&self, suffix: &str) -> bool {
        self.file_name()
            .to_lowercase()
            .ends_with(&suffix.to_lowercase())
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl PartialEq for FileIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FileIdentity {}

impl Hash for FileIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for FileIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Debug for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileIdentity({})", self.path.display())
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_components_are_removed() {
        let a = FileIdentity::new("/src/engine/./core/../core/Math.cpp");
        let b = FileIdentity::new("/src/engine/core/Math.cpp");
        assert_eq!(a, b);
        assert_eq!(a.path(), Path::new("/src/engine/core/Math.cpp"));
    }

    #[test]
    fn relative_paths_become_absolute() {
        let id = FileIdentity::new("Math.cpp");
        assert!(id.path().is_absolute());
        assert_eq!(id.file_name(), "Math.cpp");
    }

    #[test]
    fn suffix_check_ignores_case() {
        let id = FileIdentity::new("/src/Widget.GEN.cpp");
        assert!(id.has_suffix(".gen.cpp"));
        assert!(!id.has_suffix(".init.gen.cpp"));
    }

    #[test]
    fn case_folding_follows_host() {
        let upper = FileIdentity::new("/Src/A.cpp");
        let lower = FileIdentity::new("/src/a.cpp");
        assert_eq!(upper == lower, FOLD_CASE);
    }
}
