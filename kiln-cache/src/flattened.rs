//! Transitive include lists per source file.

use crate::error::CacheResult;
use crate::fingerprint::{FileItem, FileRegistry};
use crate::identity::FileIdentity;
use crate::persistent::{
    CacheReader, CacheSignature, CacheValue, CacheWriter, PathTable, PersistentKeyedCache,
};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Signature of flattened include cache files.
pub const FLATTENED_CACHE_SIGNATURE: CacheSignature = CacheSignature::new(*b"FI", 1);

struct FlattenedEntry {
    pch: Option<FileIdentity>,
    includes: Vec<FileIdentity>,
    items: OnceLock<Vec<Arc<FileItem>>>,
}

impl FlattenedEntry {
    fn new(pch: Option<FileIdentity>, includes: Vec<FileIdentity>) -> Self {
        Self {
            pch,
            includes,
            items: OnceLock::new(),
        }
    }
}

impl CacheValue for FlattenedEntry {
    fn collect_paths(&self, table: &mut PathTable) {
        if let Some(pch) = &self.pch {
            let _ = table.intern(pch);
        }
        for include in &self.includes {
            let _ = table.intern(include);
        }
    }

    fn write(&self, writer: &mut CacheWriter<'_>) -> CacheResult<()> {
        match &self.pch {
            Some(pch) => {
                writer.write_u8(1);
                writer.write_path(pch)?;
            }
            None => writer.write_u8(0),
        }
        writer.write_len(self.includes.len())?;
        for include in &self.includes {
            writer.write_path(include)?;
        }
        Ok(())
    }

    fn read(reader: &mut CacheReader<'_>) -> CacheResult<Self> {
        let pch = match reader.read_u8()? {
            0 => None,
            _ => Some(reader.read_path()?),
        };
        let count = reader.read_len()?;
        let mut includes = Vec::with_capacity(count);
        for _ in 0..count {
            includes.push(reader.read_path()?);
        }
        Ok(Self::new(pch, includes))
    }
}

/// Every file a source file pulls in, directly or indirectly.
///
/// Entries are replaced wholesale. File items are looked up in the registry
/// the first time an entry is read and reused afterwards.
pub struct FlattenedIncludeCache {
    store: PersistentKeyedCache<FlattenedEntry>,
    registry: Arc<FileRegistry>,
}

impl FlattenedIncludeCache {
    /// Load the cache at `path`.
    pub fn load(path: impl Into<PathBuf>, registry: Arc<FileRegistry>) -> Self {
        Self {
            store: PersistentKeyedCache::load(path, FLATTENED_CACHE_SIGNATURE),
            registry,
        }
    }

    /// Replace the transitive includes of `file`.
    pub fn set_dependencies_for_file(
        &mut self,
        file: &FileItem,
        pch: Option<&FileItem>,
        includes: &[Arc<FileItem>],
    ) {
        let entry = FlattenedEntry::new(
            pch.map(|item| item.identity().clone()),
            includes.iter().map(|item| item.identity().clone()).collect(),
        );
        let _ = entry.items.set(includes.to_vec());
        self.store.insert(file.identity().clone(), entry);
    }

    /// Transitive includes of `file`, if cached.
    pub fn get_dependencies_for_file(&self, file: &FileItem) -> Option<&[Arc<FileItem>]> {
        let entry = self.store.get(file.identity())?;
        let items = entry.items.get_or_init(|| {
            entry
                .includes
                .iter()
                .map(|identity| self.registry.item_for(identity))
                .collect()
        });
        Some(items.as_slice())
    }

    /// Precompiled header recorded for `file`.
    #[must_use]
    pub fn pch_for_file(&self, file: &FileItem) -> Option<&FileIdentity> {
        self.store.get(file.identity())?.pch.as_ref()
    }

    /// Forget `file`, e.g. after it was absorbed into a unity unit.
    pub fn remove_dependencies_for_file(&mut self, file: &FileIdentity) -> bool {
        self.store.remove(file).is_some()
    }

    /// Persist the cache if it changed. Failures are logged, not returned.
    pub fn save(&mut self) {
        self.store.save();
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
    use tempfile::TempDir;

    #[test]
    fn round_trip_with_pch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Flat.bin");

        {
            let registry = Arc::new(FileRegistry::new());
            let mut cache = FlattenedIncludeCache::load(&path, Arc::clone(&registry));
            let source = registry.item("/src/Widget.cpp");
            let pch = registry.item("/src/Shared.h");
            let includes = vec![registry.item("/src/Widget.h"), registry.item("/src/Core.h")];
            cache.set_dependencies_for_file(&source, Some(&pch), &includes);
            cache.save();
        }

        let registry = Arc::new(FileRegistry::new());
        let cache = FlattenedIncludeCache::load(&path, Arc::clone(&registry));
        let source = registry.item("/src/Widget.cpp");

        let includes = cache.get_dependencies_for_file(&source).unwrap();
        let names: Vec<_> = includes.iter().map(|i| i.identity().file_name()).collect();
        assert_eq!(names, vec!["Widget.h", "Core.h"]);
        assert_eq!(
            cache.pch_for_file(&source),
            Some(&FileIdentity::new("/src/Shared.h"))
        );
    }

    #[test]
    fn lookups_share_registry_items() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(FileRegistry::new());
        let mut cache = FlattenedIncludeCache::load(tmp.path().join("Flat.bin"), Arc::clone(&registry));
        let source = registry.item("/src/a.cpp");
        let header = registry.item("/src/a.h");
        cache.set_dependencies_for_file(&source, None, std::slice::from_ref(&header));

        let includes = cache.get_dependencies_for_file(&source).unwrap();
        assert!(Arc::ptr_eq(&includes[0], &header));
        assert!(cache.pch_for_file(&source).is_none());
    }

    #[test]
    fn removing_an_entry_marks_dirty() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(FileRegistry::new());
        let mut cache = FlattenedIncludeCache::load(tmp.path().join("Flat.bin"), Arc::clone(&registry));
        let source = registry.item("/src/a.cpp");
        cache.set_dependencies_for_file(&source, None, &[]);
        cache.save();
        assert!(!cache.is_dirty());

        assert!(cache.remove_dependencies_for_file(source.identity()));
        assert!(!cache.remove_dependencies_for_file(source.identity()));
        assert!(cache.is_dirty());
        assert!(cache.get_dependencies_for_file(&source).is_none());
    }
}
