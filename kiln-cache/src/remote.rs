//! Batched metadata lookups for files that live on a remote build host.

use crate::error::CacheResult;
use crate::fingerprint::FileFingerprint;
use crate::identity::FileIdentity;
use filetime::FileTime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Metadata for one remote file, as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileStat {
    /// File the stat belongs to.
    pub identity: FileIdentity,
    /// Whether the host found the file.
    pub exists: bool,
    /// Size in bytes.
    pub length: u64,
    /// Modification time on the host.
    pub last_write: Option<FileTime>,
}

/// A host able to stat many files in one round trip.
pub trait RemoteFileInfo: Send + Sync {
    /// Stat every file in `files`. Files missing from the answer are
    /// treated as non-existent.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Remote` when the host could not be reached.
    fn batch_fingerprint(&self, files: &[FileIdentity]) -> CacheResult<Vec<RemoteFileStat>>;
}

#[derive(Default)]
struct BridgeState {
    pending: Vec<FileIdentity>,
    resolved: HashMap<FileIdentity, FileFingerprint>,
    batches: usize,
}

/// Defers remote stat calls and resolves them in batches.
///
/// Identities are queued as remote items are registered. The first
/// fingerprint request for an unresolved identity flushes the whole queue.
pub struct RemoteFingerprintBridge {
    source: Arc<dyn RemoteFileInfo>,
    state: Mutex<BridgeState>,
}

impl RemoteFingerprintBridge {
    /// Create a bridge over `source`.
    pub fn new(source: Arc<dyn RemoteFileInfo>) -> Self {
        Self {
            source,
            state: Mutex::new(BridgeState::default()),
        }
    }

    /// Queue `identity` for the next batch.
    pub fn enqueue(&self, identity: FileIdentity) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.resolved.contains_key(&identity) && !state.pending.contains(&identity) {
            state.pending.push(identity);
        }
    }

    /// Fingerprint of `identity`, flushing the pending batch if needed.
    ///
    /// A flush calls the host synchronously; async callers resolve the
    /// queue up front with [`RemoteFingerprintBridge::resolve_pending`] on a
    /// blocking thread.
    pub fn fingerprint(&self, identity: &FileIdentity) -> FileFingerprint {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fingerprint) = state.resolved.get(identity) {
            return *fingerprint;
        }
        if !state.pending.contains(identity) {
            state.pending.push(identity.clone());
        }
        self.flush(&mut state);

        state
            .resolved
            .get(identity)
            .copied()
            .unwrap_or(FileFingerprint::missing(true))
    }

    /// Resolve every queued identity in one batch.
    pub fn resolve_pending(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.pending.is_empty() {
            self.flush(&mut state);
        }
    }

    fn flush(&self, state: &mut BridgeState) {
        let batch = std::mem::take(&mut state.pending);
        state.batches += 1;
        debug!("Resolving {} remote fingerprint(s) in one batch", batch.len());

        match self.source.batch_fingerprint(&batch) {
            Ok(stats) => {
                for stat in stats {
                    let _ = state.resolved.insert(
                        stat.identity,
                        FileFingerprint {
                            exists: stat.exists,
                            last_write: stat.last_write.filter(|_| stat.exists),
                            length: if stat.exists { stat.length } else { 0 },
                            is_remote: true,
                        },
                    );
                }
            }
            Err(e) => warn!("Remote fingerprint batch of {} file(s) failed: {}", batch.len(), e),
        }

        for id in batch {
            let _ = state
                .resolved
                .entry(id)
                .or_insert(FileFingerprint::missing(true));
        }
    }

    /// Drop the resolved fingerprint of `identity`; it is re-queued.
    pub fn invalidate(&self, identity: &FileIdentity) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = state.resolved.remove(identity);
        if !state.pending.contains(identity) {
            state.pending.push(identity.clone());
        }
    }

    /// Number of batch requests sent to the host so far.
    pub fn batches_issued(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .batches
    }
}
