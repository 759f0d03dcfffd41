//! Boundary to the source cache.
//!
//! The store never fetches or verifies sources itself; it asks a
//! `SourceCache` to materialize a key into a directory. Keys are opaque
//! here, by convention `tar.gz:<hash>`, `git:<commit>` and the like.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceCacheError {
  #[error("source cache has no entry for key \"{0}\"")]
  Miss(String),

  #[error("source for key \"{key}\" is corrupt: {message}")]
  Corrupt { key: String, message: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Materializes cached sources into a build directory.
pub trait SourceCache: Send + Sync {
  /// Unpack the sources behind `key` into `target` (which exists).
  ///
  /// `unsafe_mode` permits faster extraction that may leave partial state
  /// on failure; the store only sets it when the whole build directory is
  /// discarded on any error anyway.
  fn unpack(&self, key: &str, target: &Path, unsafe_mode: bool) -> Result<(), SourceCacheError>;
}
