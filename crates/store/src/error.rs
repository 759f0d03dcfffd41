use std::path::PathBuf;

use thiserror::Error;

use hdist_core::{ArtifactId, SpecError};
use hdist_job::JobError;

use crate::source::SourceCacheError;

/// Errors from store operations and the builds they trigger.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error(transparent)]
  InvalidSpec(#[from] SpecError),

  #[error("target \"{0}\" escapes the build directory")]
  TargetEscape(String),

  #[error("artifact {0} is being built concurrently, or the store is unclean")]
  StoreRace(ArtifactId),

  #[error("build of {id} failed: {reason}")]
  BuildFailed {
    id: ArtifactId,
    reason: String,
    /// Where the build directory was kept, per the keep policy.
    build_dir: Option<PathBuf>,
  },

  #[error(transparent)]
  Sort(#[from] hdist_core::SortError),

  #[error(transparent)]
  SourceCache(#[from] SourceCacheError),

  #[error(transparent)]
  Job(#[from] JobError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
