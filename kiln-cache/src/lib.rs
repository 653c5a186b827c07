//! File fingerprints and persistent include caches for the kiln build core.
//!
//! This crate provides:
//!
//! - [`FileIdentity`]: normalized absolute paths used as cache keys
//! - [`FileRegistry`]: one shared, lazily probed [`FileItem`] per identity
//! - [`RemoteFingerprintBridge`]: batched metadata lookups on a remote host
//! - [`PersistentKeyedCache`]: signature-checked binary framing with a lock
//!   marker for interrupted builds
//! - [`IncludeResolutionCache`] and [`FlattenedIncludeCache`] on top of it
//!
//! # Example
//!
//! ```no_run
//! use kiln_cache::{FileRegistry, IncludeRecord, IncludeResolutionCache};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(FileRegistry::new());
//! let mut cache = IncludeResolutionCache::load("Intermediate/Includes.bin", Arc::clone(&registry));
//!
//! let source = registry.item("Source/Widget.cpp");
//! if cache.get_cached_dependency_info(&source).is_none() {
//!     cache.set_dependency_info(&source, vec![IncludeRecord::new("\"Widget.h\"")]);
//! }
//! cache.save();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod error;
pub mod fingerprint;
pub mod flattened;
pub mod identity;
pub mod include_resolution;
pub mod persistent;
pub mod remote;

pub use error::{CacheError, CacheResult};
pub use fingerprint::{FileFingerprint, FileItem, FileRegistry};
pub use flattened::{FLATTENED_CACHE_SIGNATURE, FlattenedIncludeCache};
pub use identity::FileIdentity;
pub use include_resolution::{
    INCLUDE_CACHE_SIGNATURE, IncludeRecord, IncludeResolution, IncludeResolutionCache,
};
pub use persistent::{
    CacheHeader, CacheReader, CacheSignature, CacheValue, CacheWriter, PathTable,
    PersistentKeyedCache, inspect,
};
pub use remote::{RemoteFileInfo, RemoteFileStat, RemoteFingerprintBridge};
