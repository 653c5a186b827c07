use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|s| s.starts_with('.'))
}

fn has_extension(entry: &DirEntry, extensions: &[&str]) -> bool {
    entry
        .path()
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Files under `root` with one of `extensions`, skipping hidden
/// directories. Sorted for a stable order.
pub fn find_source_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(true).into_iter();
    for entry in walker.filter_entry(|e| !is_hidden(e)) {
        match entry {
            Ok(entry) if entry.file_type().is_file() && has_extension(&entry, extensions) => {
                files.push(entry.into_path());
            }
            Ok(_) => {}
            Err(e) => warn!("Error reading directory entry: {}", e),
        }
    }
    files.sort();
    debug!("Found {} source file(s) in {}", files.len(), root.display());
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn skips_hidden_directories_and_other_extensions() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("Private")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join("Private/Widget.cpp"), "").unwrap();
        std::fs::write(tmp.path().join("Private/Widget.h"), "").unwrap();
        std::fs::write(tmp.path().join("Main.CPP"), "").unwrap();
        std::fs::write(tmp.path().join(".git/stash.cpp"), "").unwrap();

        let files = find_source_files(tmp.path(), &["cpp"]);
        assert_eq!(
            files,
            vec![tmp.path().join("Main.CPP"), tmp.path().join("Private/Widget.cpp")]
        );
    }
}
