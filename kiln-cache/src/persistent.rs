//! Binary framing shared by every on-disk cache.
//!
//! Layout, little-endian:
//!
//! ```text
//! u32  signature (two ASCII tag bytes in the high half, version in the low byte)
//! i64  session start of the build that wrote the file (unix seconds)
//! u32  nanoseconds of the above
//! u32  path count, then per path: u32 byte length + UTF-8 bytes
//! u32  entry count, then per entry: u32 key path index + value bytes
//! ```
//!
//! Paths are interned: a writer first collects every identity referenced by
//! keys and values, writes the table once, then writes entries by index.
//!
//! A `<cache>.lockmarker` file is created when a cache is loaded and removed
//! after a successful save. Finding one at load time means the previous build
//! stopped before saving, so the cache starts cold.

use crate::error::{CacheError, CacheResult};
use crate::identity::FileIdentity;
use filetime::FileTime;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Leading word of a cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSignature(u32);

impl CacheSignature {
    /// Build a signature from a two-character tag and a format version.
    #[must_use]
    pub const fn new(tag: [u8; 2], version: u8) -> Self {
        Self(((tag[0] as u32) << 24) | ((tag[1] as u32) << 16) | version as u32)
    }

    /// Raw value as stored on disk.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Signature read back from a file.
    #[must_use]
    pub const fn from_value(value: u32) -> Self {
        Self(value)
    }

    /// The two tag characters.
    #[must_use]
    pub fn tag(self) -> String {
        let [high, low, _, _] = self.0.to_be_bytes();
        String::from_utf8_lossy(&[high, low]).into_owned()
    }

    /// Format version.
    #[must_use]
    pub const fn version(self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl std::fmt::Display for CacheSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.tag(), self.version())
    }
}

/// Identities referenced by a cache, in write order.
#[derive(Debug, Default)]
pub struct PathTable {
    index: HashMap<FileIdentity, u32>,
    paths: Vec<FileIdentity>,
}

impl PathTable {
    /// Record `identity` and return its index.
    pub fn intern(&mut self, identity: &FileIdentity) -> u32 {
        match self.index.entry(identity.clone()) {
            Entry::Occupied(slot) => *slot.get(),
            Entry::Vacant(slot) => {
                let index = u32::try_from(self.paths.len()).unwrap_or(u32::MAX);
                self.paths.push(identity.clone());
                *slot.insert(index)
            }
        }
    }

    fn index_of(&self, identity: &FileIdentity) -> Option<u32> {
        self.index.get(identity).copied()
    }
}

/// Serializer handed to [`CacheValue::write`].
pub struct CacheWriter<'a> {
    buf: Vec<u8>,
    table: &'a PathTable,
}

impl<'a> CacheWriter<'a> {
    fn new(table: &'a PathTable) -> Self {
        Self {
            buf: Vec::new(),
            table,
        }
    }

    /// Write one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` for strings longer than `u32::MAX`.
    pub fn write_str(&mut self, value: &str) -> CacheResult<()> {
        self.write_len(value.len())?;
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Write a collection length.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` for lengths above `u32::MAX`.
    pub fn write_len(&mut self, len: usize) -> CacheResult<()> {
        let len = u32::try_from(len).map_err(|_| CacheError::corrupt("length exceeds u32"))?;
        self.write_u32(len);
        Ok(())
    }

    /// Write the table index of an identity.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` if the identity was not collected in
    /// the first pass.
    pub fn write_path(&mut self, identity: &FileIdentity) -> CacheResult<()> {
        let index = self
            .table
            .index_of(identity)
            .ok_or_else(|| CacheError::corrupt(format!("{identity} missing from path table")))?;
        self.write_u32(index);
        Ok(())
    }
}

/// Deserializer handed to [`CacheValue::read`].
pub struct CacheReader<'a> {
    data: &'a [u8],
    pos: usize,
    paths: Vec<FileIdentity>,
}

impl<'a> CacheReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            paths: Vec::new(),
        }
    }

    fn take(&mut self, len: usize) -> CacheResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CacheError::corrupt(format!("unexpected end of data at byte {}", self.pos)))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` at end of data.
    pub fn read_u8(&mut self) -> CacheResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` at end of data.
    pub fn read_u32(&mut self) -> CacheResult<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a little-endian `i64`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` at end of data.
    pub fn read_i64(&mut self) -> CacheResult<i64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(bytes))
    }

    /// Read a collection length, rejecting counts the remaining data
    /// cannot possibly hold.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` for truncated or impossible lengths.
    pub fn read_len(&mut self) -> CacheResult<usize> {
        let len = self.read_u32()? as usize;
        if len > self.data.len() - self.pos {
            return Err(CacheError::corrupt(format!(
                "length {len} exceeds remaining {} byte(s)",
                self.data.len() - self.pos
            )));
        }
        Ok(len)
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` for truncated data or invalid UTF-8.
    pub fn read_str(&mut self) -> CacheResult<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CacheError::corrupt("invalid UTF-8"))
    }

    /// Read an identity by table index.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` for an out-of-range index.
    pub fn read_path(&mut self) -> CacheResult<FileIdentity> {
        let index = self.read_u32()? as usize;
        self.paths
            .get(index)
            .cloned()
            .ok_or_else(|| CacheError::corrupt(format!("path index {index} out of range")))
    }
}

/// A value stored under a file identity in a [`PersistentKeyedCache`].
pub trait CacheValue: Sized {
    /// First pass: intern every identity the value will write.
    fn collect_paths(&self, table: &mut PathTable);

    /// Second pass: serialize the value.
    ///
    /// # Errors
    ///
    /// Propagates writer errors.
    fn write(&self, writer: &mut CacheWriter<'_>) -> CacheResult<()>;

    /// Deserialize a value.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` for malformed data.
    fn read(reader: &mut CacheReader<'_>) -> CacheResult<Self>;
}

/// Map from file identity to `V`, loaded from and saved to one file.
pub struct PersistentKeyedCache<V> {
    path: PathBuf,
    signature: CacheSignature,
    created: FileTime,
    session_start: FileTime,
    entries: HashMap<FileIdentity, V>,
    dirty: bool,
}

impl<V: CacheValue> PersistentKeyedCache<V> {
    /// Load the cache at `path`, or start an empty one.
    ///
    /// Never fails: a missing file, a lock marker, a foreign signature or a
    /// damaged header all yield an empty cache. A stream that breaks off in
    /// the middle keeps the entries read so far and is marked dirty.
    pub fn load(path: impl Into<PathBuf>, signature: CacheSignature) -> Self {
        let path = path.into();
        let session_start = FileTime::now();
        let mut cache = Self {
            path,
            signature,
            created: session_start,
            session_start,
            entries: HashMap::new(),
            dirty: false,
        };

        match cache.read_from_disk() {
            Ok(()) => debug!(
                "Loaded {} entr(ies) from {}",
                cache.entries.len(),
                cache.path.display()
            ),
            Err(e) => {
                debug!("Starting with an empty cache for {}: {}", cache.path.display(), e);
                cache.entries.clear();
                cache.created = session_start;
            }
        }

        if let Err(e) = write_lock_marker(&cache.lock_marker_path()) {
            warn!("Could not create lock marker for {}: {}", cache.path.display(), e);
        }

        cache
    }

    fn read_from_disk(&mut self) -> CacheResult<()> {
        if self.lock_marker_path().exists() {
            return Err(CacheError::Locked {
                path: self.path.clone(),
            });
        }
        let data = fs::read(&self.path).map_err(|e| CacheError::io(&self.path, e))?;
        let mut reader = CacheReader::new(&data);

        let actual = reader.read_u32()?;
        if actual != self.signature.value() {
            return Err(CacheError::SignatureMismatch {
                path: self.path.clone(),
                expected: self.signature.value(),
                actual,
            });
        }

        let seconds = reader.read_i64()?;
        let nanos = reader.read_u32()?;
        let created = FileTime::from_unix_time(seconds, nanos);

        let path_count = reader.read_len()?;
        let mut paths = Vec::with_capacity(path_count);
        for _ in 0..path_count {
            paths.push(FileIdentity::new(reader.read_str()?));
        }
        reader.paths = paths;

        let entry_count = reader.read_len()?;
        self.created = created;

        for read in 0..entry_count {
            let entry = reader
                .read_path()
                .and_then(|key| V::read(&mut reader).map(|value| (key, value)));
            match entry {
                Ok((key, value)) => {
                    let _ = self.entries.insert(key, value);
                }
                Err(e) => {
                    warn!(
                        "{} is damaged after {} of {} entries ({}), keeping what was read",
                        self.path.display(),
                        read,
                        entry_count,
                        e
                    );
                    self.dirty = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Persist the cache if it changed, logging instead of failing.
    pub fn save(&mut self) {
        if let Err(e) = self.try_save() {
            warn!("Failed to save cache {}: {}", self.path.display(), e);
        }
    }

    /// Persist the cache if it changed and clear the lock marker.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` when the file cannot be written.
    pub fn try_save(&mut self) -> CacheResult<()> {
        if self.dirty {
            let bytes = self.encode()?;
            atomic_write(&self.path, &bytes)?;
            self.dirty = false;
            self.created = self.session_start;
            debug!("Saved {} entr(ies) to {}", self.entries.len(), self.path.display());
        }

        let marker = self.lock_marker_path();
        match fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(marker, e)),
        }
    }

    fn encode(&self) -> CacheResult<Vec<u8>> {
        let mut keys: Vec<&FileIdentity> = self.entries.keys().collect();
        keys.sort();

        let mut table = PathTable::default();
        for key in &keys {
            let _ = table.intern(key);
            if let Some(value) = self.entries.get(*key) {
                value.collect_paths(&mut table);
            }
        }

        let mut writer = CacheWriter::new(&table);
        writer.write_u32(self.signature.value());
        writer.write_i64(self.session_start.unix_seconds());
        writer.write_u32(self.session_start.nanoseconds());

        writer.write_len(table.paths.len())?;
        for identity in &table.paths {
            writer.write_str(&identity.path().to_string_lossy())?;
        }

        writer.write_len(keys.len())?;
        for key in keys {
            writer.write_path(key)?;
            if let Some(value) = self.entries.get(key) {
                value.write(&mut writer)?;
            }
        }
        Ok(writer.buf)
    }

    /// Path of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the lock marker next to the cache file.
    #[must_use]
    pub fn lock_marker_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".lockmarker");
        PathBuf::from(name)
    }

    /// Session start of the build that wrote the loaded data, or of this
    /// session for a cold cache.
    #[must_use]
    pub fn created_at(&self) -> FileTime {
        self.created
    }

    /// Whether there are unsaved changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flag unsaved changes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Value stored for `key`.
    #[must_use]
    pub fn get(&self, key: &FileIdentity) -> Option<&V> {
        self.entries.get(key)
    }

    /// Mutable value stored for `key`; callers mark the cache dirty.
    pub fn get_mut(&mut self, key: &FileIdentity) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Store `value`, replacing any previous one.
    pub fn insert(&mut self, key: FileIdentity, value: V) {
        let _ = self.entries.insert(key, value);
        self.dirty = true;
    }

    /// Remove the value stored for `key`.
    pub fn remove(&mut self, key: &FileIdentity) -> Option<V> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Keep only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&FileIdentity, &V) -> bool) {
        let before = self.entries.len();
        self.entries.retain(|key, value| keep(key, value));
        if self.entries.len() != before {
            self.dirty = true;
        }
    }

    /// Mutable iteration over every value; callers mark the cache dirty.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Summary of a cache file, read without decoding its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeader {
    /// Signature found in the file.
    pub signature: CacheSignature,
    /// Session start of the build that wrote it.
    pub created: FileTime,
    /// Size of the interned path table.
    pub path_count: usize,
    /// Number of entries.
    pub entry_count: usize,
    /// Whether a lock marker is present, so the next load starts cold.
    pub locked: bool,
}

/// Read the header of the cache file at `path`.
///
/// # Errors
///
/// Returns `CacheError::Io` if the file cannot be read and
/// `CacheError::Corrupt` if the header is damaged.
pub fn inspect(path: &Path) -> CacheResult<CacheHeader> {
    let data = fs::read(path).map_err(|e| CacheError::io(path, e))?;
    let mut reader = CacheReader::new(&data);
    let signature = CacheSignature::from_value(reader.read_u32()?);
    let seconds = reader.read_i64()?;
    let nanos = reader.read_u32()?;
    let path_count = reader.read_len()?;
    for _ in 0..path_count {
        let _ = reader.read_str()?;
    }
    let entry_count = reader.read_len()?;

    let mut marker = path.as_os_str().to_owned();
    marker.push(".lockmarker");
    Ok(CacheHeader {
        signature,
        created: FileTime::from_unix_time(seconds, nanos),
        path_count,
        entry_count,
        locked: Path::new(&marker).exists(),
    })
}

fn write_lock_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path).map(drop)
}

/// Write data to a file atomically with fsync for durability.
///
/// Writes a sibling temp file, fsyncs it, then renames it over the target.
fn atomic_write(path: &Path, data: &[u8]) -> CacheResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| CacheError::io(&temp_path, e))?;
    file.write_all(data).map_err(|e| CacheError::io(&temp_path, e))?;
    file.sync_all().map_err(|e| CacheError::io(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| CacheError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    const TEST_SIGNATURE: CacheSignature = CacheSignature::new(*b"TS", 1);

    #[derive(Debug, Clone, PartialEq)]
    struct Sibling {
        other: FileIdentity,
        note: String,
    }

    impl CacheValue for Sibling {
        fn collect_paths(&self, table: &mut PathTable) {
            let _ = table.intern(&self.other);
        }

        fn write(&self, writer: &mut CacheWriter<'_>) -> CacheResult<()> {
            writer.write_path(&self.other)?;
            writer.write_str(&self.note)
        }

        fn read(reader: &mut CacheReader<'_>) -> CacheResult<Self> {
            Ok(Self {
                other: reader.read_path()?,
                note: reader.read_str()?,
            })
        }
    }

    fn sibling(other: &str, note: &str) -> Sibling {
        Sibling {
            other: FileIdentity::new(other),
            note: note.to_string(),
        }
    }

    #[test]
    fn signature_layout() {
        assert_eq!(CacheSignature::new(*b"DC", 3).value(), 0x4443_0003);
    }

    #[test]
    fn save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("siblings.bin");

        let mut cache = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        assert!(cache.is_empty());
        assert!(cache.lock_marker_path().exists());

        cache.insert(FileIdentity::new("/src/a.cpp"), sibling("/src/a.h", "first"));
        cache.insert(FileIdentity::new("/src/b.cpp"), sibling("/src/a.h", "second"));
        cache.try_save().unwrap();
        assert!(!cache.is_dirty());
        assert!(!cache.lock_marker_path().exists());

        let reloaded = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.get(&FileIdentity::new("/src/b.cpp")),
            Some(&sibling("/src/a.h", "second"))
        );
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn shared_paths_are_written_once() {
        let mut table = PathTable::default();
        let a = FileIdentity::new("/src/a.h");
        assert_eq!(table.intern(&a), 0);
        assert_eq!(table.intern(&FileIdentity::new("/src/b.h")), 1);
        assert_eq!(table.intern(&a), 0);
        assert_eq!(table.paths.len(), 2);
    }

    #[test]
    fn clean_cache_is_not_rewritten() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clean.bin");

        let mut cache = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        cache.try_save().unwrap();
        assert!(!path.exists());
        assert!(!cache.lock_marker_path().exists());
    }

    #[test]
    #[traced_test]
    fn lock_marker_forces_cold_cache() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("locked.bin");

        let mut cache = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        cache.insert(FileIdentity::new("/src/a.cpp"), sibling("/src/a.h", "x"));
        cache.try_save().unwrap();

        // A build loads the cache and crashes before saving.
        let interrupted = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        assert_eq!(interrupted.len(), 1);
        drop(interrupted);

        let next = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        assert!(next.is_empty());
        assert!(logs_contain("lock marker present"));
    }

    #[test]
    fn foreign_signature_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("foreign.bin");

        let mut cache = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        cache.insert(FileIdentity::new("/src/a.cpp"), sibling("/src/a.h", "x"));
        cache.try_save().unwrap();

        let newer = CacheSignature::new(*b"TS", 2);
        let reloaded = PersistentKeyedCache::<Sibling>::load(&path, newer);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn truncated_file_keeps_complete_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("truncated.bin");

        let mut cache = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        cache.insert(FileIdentity::new("/src/a.cpp"), sibling("/src/a.h", "alpha"));
        cache.insert(FileIdentity::new("/src/b.cpp"), sibling("/src/b.h", "beta"));
        cache.try_save().unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let reloaded = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get(&FileIdentity::new("/src/a.cpp")).is_some());
        assert!(reloaded.is_dirty());
    }

    #[test]
    fn garbage_is_a_cold_cache() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("garbage.bin");
        fs::write(&path, b"\x01\x02").unwrap();

        let cache = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        assert!(cache.is_empty());
    }

    #[test]
    fn impossible_entry_count_is_rejected() {
        let table = PathTable::default();
        let mut writer = CacheWriter::new(&table);
        writer.write_u32(u32::MAX);
        let mut reader = CacheReader::new(&writer.buf);
        assert!(matches!(reader.read_len(), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn created_time_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("time.bin");

        let mut cache = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        let started = cache.created_at();
        cache.insert(FileIdentity::new("/src/a.cpp"), sibling("/src/a.h", "x"));
        cache.try_save().unwrap();

        let reloaded = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        assert_eq!(reloaded.created_at(), started);
    }

    #[test]
    fn header_is_readable_without_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("inspect.bin");

        let mut cache = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        cache.insert(FileIdentity::new("/src/a.cpp"), sibling("/src/a.h", "x"));
        cache.insert(FileIdentity::new("/src/b.cpp"), sibling("/src/a.h", "y"));
        cache.try_save().unwrap();

        let header = inspect(&path).unwrap();
        assert_eq!(header.signature, TEST_SIGNATURE);
        assert_eq!(header.signature.to_string(), "TS v1");
        assert_eq!(header.entry_count, 2);
        assert_eq!(header.path_count, 3);
        assert!(!header.locked);

        let _reopened = PersistentKeyedCache::<Sibling>::load(&path, TEST_SIGNATURE);
        assert!(inspect(&path).unwrap().locked);
    }
}
