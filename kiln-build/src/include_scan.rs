//! Include scanning for compile actions.
//!
//! The `#include` directives of each file are read once and kept in the
//! include resolution cache. Tokens resolve against the includer's directory
//! (quoted form only) and then the `-I`/`-isystem` directories of the action.
//! The transitive closure of every compile source ends up in the flattened
//! include cache, where outdatedness checks pick it up.

use crate::action_graph::{ActionKind, BuildAction};
use crate::error::BuildResult;
use kiln_cache::{
    FileIdentity, FileItem, FileRegistry, FlattenedIncludeCache, IncludeRecord, IncludeResolution,
    IncludeResolutionCache,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const SOURCE_EXTENSIONS: [&str; 6] = ["c", "cc", "cpp", "cxx", "m", "mm"];

/// Include tokens in `content` with their delimiters, e.g. `"Core.h"` or
/// `<vector>`.
pub fn find_include_directives(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let rest = line
                .trim_start()
                .strip_prefix('#')?
                .trim_start()
                .strip_prefix("include")?
                .trim_start();
            let close = match rest.chars().next()? {
                '"' => '"',
                '<' => '>',
                _ => return None,
            };
            let end = rest[1..].find(close)? + 2;
            Some(rest[..end].to_string())
        })
        .collect()
}

/// Header search directories named on the command line of `action`.
///
/// Relative directories are taken from the action's working directory.
pub fn include_search_paths(action: &BuildAction) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut args = action.arguments.iter();
    while let Some(arg) = args.next() {
        let dir = match arg.as_str() {
            "-I" | "-isystem" | "-iquote" => args.next().map(String::as_str),
            _ => arg.strip_prefix("-I").filter(|dir| !dir.is_empty()),
        };
        if let Some(dir) = dir {
            let dir = action.working_directory.join(dir.trim_matches('"'));
            if !paths.contains(&dir) {
                paths.push(dir);
            }
        }
    }
    paths
}

fn is_source(identity: &FileIdentity) -> bool {
    identity
        .path()
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

fn resolve_include(token: &str, base_dir: &Path, search_paths: &[PathBuf]) -> Option<PathBuf> {
    let name = token.get(1..token.len().saturating_sub(1))?;
    if name.is_empty() {
        return None;
    }
    let local = token.starts_with('"').then(|| base_dir.join(name));
    local
        .into_iter()
        .chain(search_paths.iter().map(|dir| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Walks include directives through the include resolution cache.
pub struct IncludeScanner<'a> {
    cache: &'a mut IncludeResolutionCache,
    registry: &'a FileRegistry,
    verify_resolved: bool,
}

impl<'a> IncludeScanner<'a> {
    pub fn new(cache: &'a mut IncludeResolutionCache, registry: &'a FileRegistry) -> Self {
        Self {
            cache,
            registry,
            verify_resolved: false,
        }
    }

    /// Resolve includes again even when an earlier build resolved them, so
    /// that a different result reaches the cache's conflict check.
    #[must_use]
    pub fn verify_resolved(mut self, enabled: bool) -> Self {
        self.verify_resolved = enabled;
        self
    }

    /// Flatten the includes of the source prerequisites of every compile
    /// action into `flattened`. Returns the number of sources scanned.
    ///
    /// # Errors
    ///
    /// Returns `Cache(ConflictingIncludeResolution)` when verification finds
    /// an include that now resolves elsewhere.
    pub fn scan_actions<'b>(
        &mut self,
        actions: impl IntoIterator<Item = &'b BuildAction>,
        flattened: &mut FlattenedIncludeCache,
    ) -> BuildResult<usize> {
        let mut scanned = 0;
        for action in actions
            .into_iter()
            .filter(|action| action.kind == ActionKind::Compile)
        {
            let search_paths = include_search_paths(action);
            for prerequisite in action.prerequisites.iter().filter(|item| is_source(item)) {
                let source = self.registry.item_for(prerequisite);
                if !source.exists() || source.is_remote() {
                    continue;
                }
                let includes: Vec<Arc<FileItem>> = self
                    .flatten(&source, &search_paths)?
                    .iter()
                    .map(|include| self.registry.item_for(include))
                    .collect();
                debug!("{}: {} include(s)", prerequisite, includes.len());
                flattened.set_dependencies_for_file(&source, None, &includes);
                scanned += 1;
            }
        }
        Ok(scanned)
    }

    /// Every file reachable through the includes of `source`, in discovery
    /// order, without `source` itself.
    ///
    /// # Errors
    ///
    /// See [`IncludeScanner::scan_actions`].
    pub fn flatten(
        &mut self,
        source: &FileItem,
        search_paths: &[PathBuf],
    ) -> BuildResult<Vec<FileIdentity>> {
        let mut seen = HashSet::new();
        let _ = seen.insert(source.identity().clone());
        let mut order = Vec::new();
        let mut pending = vec![self.registry.item_for(source.identity())];

        while let Some(file) = pending.pop() {
            for include in self.direct_includes(&file, search_paths)? {
                if seen.insert(include.clone()) {
                    pending.push(self.registry.item_for(&include));
                    order.push(include);
                }
            }
        }
        Ok(order)
    }

    fn direct_includes(
        &mut self,
        file: &FileItem,
        search_paths: &[PathBuf],
    ) -> BuildResult<Vec<FileIdentity>> {
        let cached = self
            .cache
            .get_cached_dependency_info(file)
            .map(<[IncludeRecord]>::to_vec);
        let records = if let Some(records) = cached {
            records
        } else {
            let content = match std::fs::read_to_string(file.path()) {
                Ok(content) => content,
                Err(e) => {
                    debug!("Cannot scan {}: {}", file.path().display(), e);
                    return Ok(Vec::new());
                }
            };
            let records: Vec<IncludeRecord> = find_include_directives(&content)
                .into_iter()
                .map(IncludeRecord::new)
                .collect();
            self.cache.set_dependency_info(file, records.clone());
            records
        };

        let base_dir = file.path().parent().map(Path::to_path_buf).unwrap_or_default();
        let mut includes = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match &record.resolution {
                IncludeResolution::Resolved(target) if !self.verify_resolved => {
                    includes.push(target.clone());
                }
                IncludeResolution::Unresolved => {}
                previous => match resolve_include(&record.token, &base_dir, search_paths) {
                    Some(path) => {
                        let item = self.registry.item(&path);
                        self.cache.cache_resolved_include_full_path(file, index, &item)?;
                        includes.push(item.identity().clone());
                    }
                    None => {
                        if let IncludeResolution::Resolved(target) = previous {
                            includes.push(target.clone());
                        } else {
                            self.cache.cache_unresolved_include(file, index);
                        }
                    }
                },
            }
        }
        Ok(includes)
    }
}
