//! Error types for cache operations.

use std::path::PathBuf;

/// Errors that can occur during cache operations.
///
/// Most cache operations are fail-safe: a damaged or foreign cache file
/// results in a cold cache rather than a hard failure. Only
/// [`CacheError::ConflictingIncludeResolution`] is meant to reach the user.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing a cache file.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The leading signature does not match the expected tag and version.
    #[error("signature mismatch in {path}: expected {expected:#010x}, got {actual:#010x}")]
    SignatureMismatch {
        /// The cache file path.
        path: PathBuf,
        /// Signature this build understands.
        expected: u32,
        /// Signature found in the file.
        actual: u32,
    },

    /// A lock marker from an interrupted build was found next to the cache.
    #[error("lock marker present for {path}")]
    Locked {
        /// The cache file path.
        path: PathBuf,
    },

    /// The byte stream ended early or described an impossible structure.
    #[error("corrupt cache data: {reason}")]
    Corrupt {
        /// Description of the problem.
        reason: String,
    },

    /// An include token resolved to a different file than the one recorded.
    #[error(
        "include \"{token}\" in {source_file} resolved to {current}, previously cached as {previous}"
    )]
    ConflictingIncludeResolution {
        /// File containing the include directive.
        source_file: PathBuf,
        /// Raw include token as written in the source.
        token: String,
        /// Resolution stored in the cache.
        previous: PathBuf,
        /// Resolution produced by the current build.
        current: PathBuf,
    },

    /// A remote host could not answer a fingerprint request.
    #[error("remote fingerprint query failed: {reason}")]
    Remote {
        /// Description of the transport failure.
        reason: String,
    },
}

impl CacheError {
    /// Wrap an I/O error together with the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_io_error() {
        let err = CacheError::io(
            "/tmp/Makefile.dep",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/Makefile.dep"));
        assert!(msg.contains("missing"));
    }

    #[test]
    fn display_signature_mismatch() {
        let err = CacheError::SignatureMismatch {
            path: PathBuf::from("deps.bin"),
            expected: 0x4443_0001,
            actual: 0x4649_0001,
        };
        assert_eq!(
            err.to_string(),
            "signature mismatch in deps.bin: expected 0x44430001, got 0x46490001"
        );
    }

    #[test]
    fn display_conflict_names_both_paths() {
        let err = CacheError::ConflictingIncludeResolution {
            source_file: PathBuf::from("/src/a.cpp"),
            token: "Core.h".to_string(),
            previous: PathBuf::from("/src/old/Core.h"),
            current: PathBuf::from("/src/new/Core.h"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/src/a.cpp"));
        assert!(msg.contains("/src/old/Core.h"));
        assert!(msg.contains("/src/new/Core.h"));
    }
}
