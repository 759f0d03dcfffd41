//! The content-addressed artifact store.
//!
//! Artifacts live under `<artifact_root>/<name>/<version>/<short-digest>`,
//! with a full-digest symlink next to the short directory so lookups by
//! complete ID never depend on how short the prefix happened to be. Presence
//! of the full-digest symlink is the commit point: an artifact either
//! resolves completely or not at all.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use hdist_core::{ArtifactId, BuildSpec};
use hdist_job::ArtifactResolver;

use crate::build::ArtifactBuild;
use crate::error::StoreError;
use crate::source::SourceCache;

/// Digest prefix length first tried for on-disk directory names.
pub const SHORT_DIGEST_LEN: usize = 4;

/// What to do with the build directory when a build finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepBuildPolicy {
  /// Always remove it.
  Never,
  /// Keep it when the build failed, for debugging.
  #[serde(rename = "error")]
  OnError,
  /// Keep it unconditionally.
  Always,
}

/// A build store rooted at a pair of directories: one for finished
/// artifacts, one for in-flight build directories.
pub struct BuildStore {
  artifact_root: PathBuf,
  build_root: PathBuf,
  keep_policy: KeepBuildPolicy,
  /// Mapping from `virtual:` IDs to the concrete artifact IDs that satisfy
  /// them in this store's builds.
  virtuals: BTreeMap<String, String>,
}

impl BuildStore {
  pub fn new(
    artifact_root: impl Into<PathBuf>,
    build_root: impl Into<PathBuf>,
    keep_policy: KeepBuildPolicy,
    virtuals: BTreeMap<String, String>,
  ) -> Self {
    Self {
      artifact_root: artifact_root.into(),
      build_root: build_root.into(),
      keep_policy,
      virtuals,
    }
  }

  /// Create the store directories if they do not exist yet.
  pub fn init(&self) -> Result<(), StoreError> {
    fs::create_dir_all(&self.artifact_root)?;
    fs::create_dir_all(&self.build_root)?;
    info!(
      artifact_root = %self.artifact_root.display(),
      build_root = %self.build_root.display(),
      "store initialized"
    );
    Ok(())
  }

  pub fn artifact_root(&self) -> &Path {
    &self.artifact_root
  }

  pub fn build_root(&self) -> &Path {
    &self.build_root
  }

  pub fn keep_policy(&self) -> KeepBuildPolicy {
    self.keep_policy
  }

  pub fn virtuals(&self) -> &BTreeMap<String, String> {
    &self.virtuals
  }

  /// Resolve a full artifact ID to its directory, if present.
  pub fn resolve(&self, id: &ArtifactId) -> Option<PathBuf> {
    let link = self
      .artifact_root
      .join(&id.name)
      .join(&id.version)
      .join(&id.digest);
    fs::canonicalize(link).ok()
  }

  /// Whether the artifact for `spec` is already built.
  pub fn is_present(&self, spec: &BuildSpec) -> Result<bool, StoreError> {
    Ok(self.resolve(&spec.artifact_id()?).is_some())
  }

  /// Return the artifact for `spec`, building it first if needed.
  ///
  /// The artifact becomes visible only after its build script succeeded and
  /// its log was copied in; a failed build leaves no trace in the artifact
  /// root.
  pub async fn ensure_present(
    &self,
    spec: &BuildSpec,
    source_cache: &dyn SourceCache,
  ) -> Result<(ArtifactId, PathBuf), StoreError> {
    let canonical = spec.canonicalize()?;
    let id = canonical.artifact_id()?;
    if let Some(path) = self.resolve(&id) {
      debug!(artifact = %id.shortened(SHORT_DIGEST_LEN), "artifact already present");
      return Ok((id, path));
    }
    let path = ArtifactBuild::new(self, canonical, id.clone()).run(source_cache).await?;
    Ok((id, path))
  }
}

impl ArtifactResolver for BuildStore {
  fn resolve_artifact(&self, id: &str) -> Option<PathBuf> {
    let id: ArtifactId = id.parse().ok()?;
    self.resolve(&id)
  }
}
