//! Lazily probed file metadata and the session-wide identity map.

use crate::identity::FileIdentity;
use crate::remote::RemoteFingerprintBridge;
use filetime::FileTime;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Existence, modification time and size of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    /// Whether the file was found.
    pub exists: bool,
    /// Last modification time, `None` when the file does not exist.
    pub last_write: Option<FileTime>,
    /// Size in bytes, zero when the file does not exist.
    pub length: u64,
    /// Whether the metadata came from a remote host.
    pub is_remote: bool,
}

impl FileFingerprint {
    /// Fingerprint of a file that does not exist.
    #[must_use]
    pub const fn missing(is_remote: bool) -> Self {
        Self {
            exists: false,
            last_write: None,
            length: 0,
            is_remote,
        }
    }

    /// Stat a local file.
    #[must_use]
    pub fn probe(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => Self {
                exists: true,
                last_write: Some(FileTime::from_last_modification_time(&metadata)),
                length: metadata.len(),
                is_remote: false,
            },
            _ => Self::missing(false),
        }
    }
}

enum Origin {
    Local,
    Remote(Arc<RemoteFingerprintBridge>),
}

/// The single shared record for one file identity.
///
/// Metadata is fetched on first access and cached until
/// [`FileItem::reset_file_info`] is called.
pub struct FileItem {
    identity: FileIdentity,
    origin: Origin,
    fingerprint: Mutex<Option<FileFingerprint>>,
}

impl FileItem {
    /// Identity of this file.
    #[must_use]
    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    /// Normalized absolute path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.identity.path()
    }

    /// Whether metadata for this item lives on a remote host.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.origin, Origin::Remote(_))
    }

    /// Current fingerprint, probing on first access.
    pub fn fingerprint(&self) -> FileFingerprint {
        let mut slot = self
            .fingerprint
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(fingerprint) = *slot {
            return fingerprint;
        }
        let fingerprint = match &self.origin {
            Origin::Local => FileFingerprint::probe(self.path()),
            Origin::Remote(bridge) => bridge.fingerprint(&self.identity),
        };
        *slot = Some(fingerprint);
        fingerprint
    }

    /// Whether the file exists.
    pub fn exists(&self) -> bool {
        self.fingerprint().exists
    }

    /// Size in bytes.
    pub fn length(&self) -> u64 {
        self.fingerprint().length
    }

    /// Last modification time.
    pub fn last_write(&self) -> Option<FileTime> {
        self.fingerprint().last_write
    }

    /// Forget cached metadata so the next access probes again.
    pub fn reset_file_info(&self) {
        *self
            .fingerprint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        if let Origin::Remote(bridge) = &self.origin {
            bridge.invalidate(&self.identity);
        }
    }
}

impl std::fmt::Debug for FileItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileItem")
            .field("identity", &self.identity)
            .field("remote", &self.is_remote())
            .finish_non_exhaustive()
    }
}

/// Identity map for one build session.
///
/// Every component that needs to deduplicate files receives the same
/// registry, so each identity maps to exactly one [`FileItem`].
#[derive(Default)]
pub struct FileRegistry {
    items: Mutex<HashMap<FileIdentity, Arc<FileItem>>>,
}

impl FileRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Item for a local path.
    pub fn item(&self, path: impl AsRef<Path>) -> Arc<FileItem> {
        self.item_for(&FileIdentity::new(path))
    }

    /// Item for an already normalized identity.
    pub fn item_for(&self, identity: &FileIdentity) -> Arc<FileItem> {
        self.get_or_insert(identity, || Origin::Local)
    }

    /// Item whose metadata is resolved through `bridge`.
    ///
    /// The identity is queued on the bridge immediately so that all remote
    /// items registered before the first access are fetched in one batch.
    pub fn remote_item(
        &self,
        path: impl AsRef<Path>,
        bridge: &Arc<RemoteFingerprintBridge>,
    ) -> Arc<FileItem> {
        let identity = FileIdentity::new(path);
        self.get_or_insert(&identity, || {
            bridge.enqueue(identity.clone());
            Origin::Remote(Arc::clone(bridge))
        })
    }

    fn get_or_insert(&self, identity: &FileIdentity, origin: impl FnOnce() -> Origin) -> Arc<FileItem> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(items.entry(identity.clone()).or_insert_with(|| {
            Arc::new(FileItem {
                identity: identity.clone(),
                origin: origin(),
                fingerprint: Mutex::new(None),
            })
        }))
    }

    /// Number of registered identities.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End the session: drop every item.
    pub fn clear(&self) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
