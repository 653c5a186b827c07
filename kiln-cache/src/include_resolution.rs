//! Per-file include directive cache.
//!
//! Stores, for each source file, the raw include tokens it contains and how
//! far each one has been resolved. An entry is only trusted while the source
//! file is older than the cache and every resolved include still exists.

use crate::error::{CacheError, CacheResult};
use crate::fingerprint::{FileItem, FileRegistry};
use crate::identity::FileIdentity;
use crate::persistent::{
    CacheReader, CacheSignature, CacheValue, CacheWriter, PathTable, PersistentKeyedCache,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Signature of include resolution cache files.
pub const INCLUDE_CACHE_SIGNATURE: CacheSignature = CacheSignature::new(*b"DC", 1);

/// How far an include token has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeResolution {
    /// Resolution has not been tried in this session.
    NotAttempted,
    /// Resolution was tried and found nothing.
    Unresolved,
    /// The token resolves to this file.
    Resolved(FileIdentity),
}

/// One include directive of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeRecord {
    /// Token as written, e.g. `"Core/Math.h"` or `<vector>`.
    pub token: String,
    /// Resolution state.
    pub resolution: IncludeResolution,
}

impl IncludeRecord {
    /// A record whose resolution has not been attempted.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            resolution: IncludeResolution::NotAttempted,
        }
    }

    /// A record already resolved to `target`.
    pub fn resolved(token: impl Into<String>, target: FileIdentity) -> Self {
        Self {
            token: token.into(),
            resolution: IncludeResolution::Resolved(target),
        }
    }
}

#[derive(Debug)]
struct DependencyEntry {
    includes: Vec<IncludeRecord>,
    // Written this session, so the source timestamp check does not apply.
    fresh: bool,
}

const NOT_ATTEMPTED: u8 = 0;
const UNRESOLVED: u8 = 1;
const RESOLVED: u8 = 2;

impl CacheValue for DependencyEntry {
    fn collect_paths(&self, table: &mut PathTable) {
        for record in &self.includes {
            if let IncludeResolution::Resolved(target) = &record.resolution {
                let _ = table.intern(target);
            }
        }
    }

    fn write(&self, writer: &mut CacheWriter<'_>) -> CacheResult<()> {
        writer.write_len(self.includes.len())?;
        for record in &self.includes {
            writer.write_str(&record.token)?;
            match &record.resolution {
                IncludeResolution::NotAttempted => writer.write_u8(NOT_ATTEMPTED),
                IncludeResolution::Unresolved => writer.write_u8(UNRESOLVED),
                IncludeResolution::Resolved(target) => {
                    writer.write_u8(RESOLVED);
                    writer.write_path(target)?;
                }
            }
        }
        Ok(())
    }

    fn read(reader: &mut CacheReader<'_>) -> CacheResult<Self> {
        let count = reader.read_len()?;
        let mut includes = Vec::with_capacity(count);
        for _ in 0..count {
            let token = reader.read_str()?;
            let resolution = match reader.read_u8()? {
                NOT_ATTEMPTED => IncludeResolution::NotAttempted,
                UNRESOLVED => IncludeResolution::Unresolved,
                RESOLVED => IncludeResolution::Resolved(reader.read_path()?),
                other => {
                    return Err(CacheError::Corrupt {
                        reason: format!("unknown include state {other}"),
                    });
                }
            };
            includes.push(IncludeRecord { token, resolution });
        }
        Ok(Self {
            includes,
            fresh: false,
        })
    }
}

/// Include directives per source file, persisted across builds.
pub struct IncludeResolutionCache {
    store: PersistentKeyedCache<DependencyEntry>,
    registry: Arc<FileRegistry>,
    test_resolve_conflicts: bool,
}

impl IncludeResolutionCache {
    /// Load the cache at `path`.
    ///
    /// Unresolved includes are reset to "not attempted" so that headers
    /// generated since the last build get a chance to resolve.
    pub fn load(path: impl Into<PathBuf>, registry: Arc<FileRegistry>) -> Self {
        let mut cache = Self {
            store: PersistentKeyedCache::load(path, INCLUDE_CACHE_SIGNATURE),
            registry,
            test_resolve_conflicts: false,
        };
        cache.reset_unresolved_dependencies();
        cache
    }

    /// Treat a changed resolution of a cached include as a fatal error.
    #[must_use]
    pub fn with_conflict_checking(mut self, enabled: bool) -> Self {
        self.test_resolve_conflicts = enabled;
        self
    }

    /// Cached include records for `file`, or `None` when absent or stale.
    ///
    /// Stale entries are evicted and the cache is marked dirty.
    pub fn get_cached_dependency_info(&mut self, file: &FileItem) -> Option<&[IncludeRecord]> {
        let key = file.identity();
        let entry = self.store.get(key)?;

        let mut valid = true;
        if !entry.fresh {
            valid = match file.last_write() {
                Some(modified) => modified < self.store.created_at(),
                None => false,
            };
            if !valid {
                debug!("{} changed since the include cache was written", file.path().display());
            }
        }
        if valid {
            valid = entry.includes.iter().all(|record| match &record.resolution {
                IncludeResolution::Resolved(target) => {
                    let exists = self.registry.item_for(target).exists();
                    if !exists {
                        debug!(
                            "Include {} of {} no longer exists",
                            target,
                            file.path().display()
                        );
                    }
                    exists
                }
                _ => true,
            });
        }

        if !valid {
            let _ = self.store.remove(key);
            return None;
        }
        self.store.get(key).map(|entry| entry.includes.as_slice())
    }

    /// Replace the include records of `file`.
    pub fn set_dependency_info(&mut self, file: &FileItem, includes: Vec<IncludeRecord>) {
        self.store.insert(
            file.identity().clone(),
            DependencyEntry {
                includes,
                fresh: true,
            },
        );
    }

    /// Record that include number `index` of `file` resolves to `resolved`.
    ///
    /// # Errors
    ///
    /// With conflict checking enabled, returns
    /// `CacheError::ConflictingIncludeResolution` if a different target was
    /// recorded before. Only the raw token is compared; two includers whose
    /// search paths legitimately resolve the same token differently are not
    /// told apart.
    pub fn cache_resolved_include_full_path(
        &mut self,
        file: &FileItem,
        index: usize,
        resolved: &FileItem,
    ) -> CacheResult<()> {
        let test_conflicts = self.test_resolve_conflicts;
        let Some(record) = self
            .store
            .get_mut(file.identity())
            .and_then(|entry| entry.includes.get_mut(index))
        else {
            debug!("No include #{} cached for {}", index, file.path().display());
            return Ok(());
        };

        let target = resolved.identity();
        if let IncludeResolution::Resolved(previous) = &record.resolution {
            if previous == target {
                return Ok(());
            }
            if test_conflicts {
                return Err(CacheError::ConflictingIncludeResolution {
                    source_file: file.path().to_path_buf(),
                    token: record.token.clone(),
                    previous: previous.path().to_path_buf(),
                    current: target.path().to_path_buf(),
                });
            }
        }

        record.resolution = IncludeResolution::Resolved(target.clone());
        self.store.mark_dirty();
        Ok(())
    }

    /// Turn every `Unresolved` include back into `NotAttempted`.
    pub fn reset_unresolved_dependencies(&mut self) {
        let mut changed = false;
        for entry in self.store.values_mut() {
            for record in &mut entry.includes {
                if record.resolution == IncludeResolution::Unresolved {
                    record.resolution = IncludeResolution::NotAttempted;
                    changed = true;
                }
            }
        }
        if changed {
            self.store.mark_dirty();
        }
    }

    /// Record that include number `index` of `file` resolves to nothing.
    pub fn cache_unresolved_include(&mut self, file: &FileItem, index: usize) {
        let record = self
            .store
            .get_mut(file.identity())
            .and_then(|entry| entry.includes.get_mut(index));
        if let Some(record) = record
            && record.resolution != IncludeResolution::Unresolved
        {
            record.resolution = IncludeResolution::Unresolved;
            self.store.mark_dirty();
        }
    }

    /// Persist the cache if it changed. Failures are logged, not returned.
    pub fn save(&mut self) {
        if self.store.is_dirty() {
            self.evict_unchecked_entries();
        }
        self.store.save();
    }

    // Saving restamps the file with this session's start, so an entry loaded
    // from disk must not outlive a source edit made after the old stamp.
    fn evict_unchecked_entries(&mut self) {
        let written = self.store.created_at();
        let registry = Arc::clone(&self.registry);
        self.store.retain(|key, entry| {
            let keep = entry.fresh
                || registry
                    .item_for(key)
                    .last_write()
                    .is_some_and(|modified| modified < written);
            if !keep {
                debug!("Dropping include cache entry of {} before saving", key);
            }
            keep
        });
    }

    /// Number of cached source files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether no source file is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Whether there are unsaved changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.store.is_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        cache_path: PathBuf,
        source: PathBuf,
        header: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("Widget.cpp");
        let header = tmp.path().join("Widget.h");
        fs::write(&source, "#include \"Widget.h\"\n").unwrap();
        fs::write(&header, "#pragma once\n").unwrap();

        // Sources predate the cache.
        let past = FileTime::from_unix_time(1_600_000_000, 0);
        set_file_mtime(&source, past).unwrap();
        set_file_mtime(&header, past).unwrap();

        Fixture {
            cache_path: tmp.path().join("Intermediate").join("Includes.bin"),
            _tmp: tmp,
            source,
            header,
        }
    }

    fn populate(fx: &Fixture) {
        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        let source = registry.item(&fx.source);
        cache.set_dependency_info(
            &source,
            vec![
                IncludeRecord::resolved("\"Widget.h\"", FileIdentity::new(&fx.header)),
                IncludeRecord {
                    token: "\"Generated.h\"".to_string(),
                    resolution: IncludeResolution::Unresolved,
                },
            ],
        );
        cache.save();
    }

    #[test]
    fn entries_survive_a_round_trip() {
        let fx = fixture();
        populate(&fx);

        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        let source = registry.item(&fx.source);

        let records = cache.get_cached_dependency_info(&source).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].resolution,
            IncludeResolution::Resolved(FileIdentity::new(&fx.header))
        );
        // Unresolved includes get another chance after a reload.
        assert_eq!(records[1].resolution, IncludeResolution::NotAttempted);
    }

    #[test]
    fn modified_source_is_evicted() {
        let fx = fixture();
        populate(&fx);

        let future = FileTime::from_unix_time(FileTime::now().unix_seconds() + 60, 0);
        set_file_mtime(&fx.source, future).unwrap();

        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        let source = registry.item(&fx.source);

        assert!(cache.get_cached_dependency_info(&source).is_none());
        assert!(cache.is_empty());
        assert!(cache.is_dirty());
    }

    #[test]
    fn source_edited_between_builds_is_not_revived_by_an_unrelated_save() {
        let fx = fixture();
        populate(&fx);

        // Edited after the first build wrote the cache.
        let first_build = crate::persistent::inspect(&fx.cache_path).unwrap().created;
        set_file_mtime(&fx.source, first_build).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        // Second build only touches another file, then saves.
        let other = fx.source.with_file_name("Other.cpp");
        fs::write(&other, "int other;\n").unwrap();
        {
            let registry = Arc::new(FileRegistry::new());
            let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
            cache.set_dependency_info(&registry.item(&other), vec![IncludeRecord::new("<vector>")]);
            cache.save();
        }

        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        assert!(cache.get_cached_dependency_info(&registry.item(&fx.source)).is_none());
        assert!(cache.get_cached_dependency_info(&registry.item(&other)).is_some());
    }

    #[test]
    fn unchanged_sources_survive_an_unrelated_save() {
        let fx = fixture();
        populate(&fx);
        {
            let registry = Arc::new(FileRegistry::new());
            let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
            assert!(cache.is_dirty());
            cache.save();
        }

        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        assert_eq!(
            cache
                .get_cached_dependency_info(&registry.item(&fx.source))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn unresolved_includes_are_recorded() {
        let fx = fixture();
        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        let source = registry.item(&fx.source);
        cache.set_dependency_info(&source, vec![IncludeRecord::new("<vector>")]);
        cache.cache_unresolved_include(&source, 0);

        let records = cache.get_cached_dependency_info(&source).unwrap();
        assert_eq!(records[0].resolution, IncludeResolution::Unresolved);
    }

    #[test]
    fn deleted_include_is_evicted() {
        let fx = fixture();
        populate(&fx);
        fs::remove_file(&fx.header).unwrap();

        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        let source = registry.item(&fx.source);

        assert!(cache.get_cached_dependency_info(&source).is_none());
        assert!(cache.is_dirty());
    }

    #[test]
    fn entries_set_this_session_are_trusted() {
        let fx = fixture();
        let future = FileTime::from_unix_time(FileTime::now().unix_seconds() + 60, 0);
        set_file_mtime(&fx.source, future).unwrap();

        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        let source = registry.item(&fx.source);
        cache.set_dependency_info(&source, vec![IncludeRecord::new("<vector>")]);

        assert_eq!(cache.get_cached_dependency_info(&source).unwrap().len(), 1);
    }

    #[test]
    fn late_resolution_is_recorded() {
        let fx = fixture();
        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry))
            .with_conflict_checking(true);
        let source = registry.item(&fx.source);
        let header = registry.item(&fx.header);

        cache.set_dependency_info(&source, vec![IncludeRecord::new("\"Widget.h\"")]);
        cache
            .cache_resolved_include_full_path(&source, 0, &header)
            .unwrap();

        let records = cache.get_cached_dependency_info(&source).unwrap();
        assert_eq!(
            records[0].resolution,
            IncludeResolution::Resolved(header.identity().clone())
        );
    }

    #[test]
    fn conflicting_resolution_is_fatal_when_checking() {
        let fx = fixture();
        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry))
            .with_conflict_checking(true);
        let source = registry.item(&fx.source);
        let other = registry.item(fx.header.with_file_name("Other.h"));

        cache.set_dependency_info(
            &source,
            vec![IncludeRecord::resolved("\"Widget.h\"", FileIdentity::new(&fx.header))],
        );

        let err = cache
            .cache_resolved_include_full_path(&source, 0, &other)
            .unwrap_err();
        assert!(matches!(err, CacheError::ConflictingIncludeResolution { ref token, .. } if token == "\"Widget.h\""));
    }

    #[test]
    fn conflicting_resolution_overwrites_without_checking() {
        let fx = fixture();
        let registry = Arc::new(FileRegistry::new());
        let mut cache = IncludeResolutionCache::load(&fx.cache_path, Arc::clone(&registry));
        let source = registry.item(&fx.source);
        let other = registry.item(fx.header.with_file_name("Other.h"));

        cache.set_dependency_info(
            &source,
            vec![IncludeRecord::resolved("\"Widget.h\"", FileIdentity::new(&fx.header))],
        );
        cache
            .cache_resolved_include_full_path(&source, 0, &other)
            .unwrap();
        assert_eq!(
            cache.store.get(source.identity()).unwrap().includes[0].resolution,
            IncludeResolution::Resolved(other.identity().clone())
        );
    }
}
