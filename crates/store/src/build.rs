//! One artifact build, from directory allocation to publication.
//!
//! The sequence is: claim the artifact directory and its full-digest
//! symlink, materialize a build directory (spec file, embedded files,
//! unpacked sources), run the job script with its output teed to
//! `build.log`, then copy the log into the artifact and discard the build
//! directory per the keep policy. Any failure before the log copy rolls the
//! artifact directory and symlink back out.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use hdist_core::{ArtifactId, BuildSpec};
use hdist_job::{JobOptions, JobSpec, LogRecord, LogSink, run_job};

use crate::error::StoreError;
use crate::source::SourceCache;
use crate::store::{BuildStore, KeepBuildPolicy, SHORT_DIGEST_LEN};

pub const BUILD_SPEC_FILE: &str = "build.json";
pub const BUILD_LOG_FILE: &str = "build.log";

/// Sink that appends each record to a log file as `LEVEL:name:line`.
pub struct FileSink {
  file: Mutex<fs::File>,
}

impl FileSink {
  pub fn create(path: &Path) -> io::Result<Self> {
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Self { file: Mutex::new(file) })
  }
}

impl LogSink for FileSink {
  fn log(&self, record: LogRecord) {
    let mut file = self.file.lock().unwrap();
    if let Err(e) = writeln!(file, "{}", record.formatted()) {
      warn!(error = %e, "failed to write build log record");
    }
  }
}

/// State for building one artifact. `spec` is already canonical.
pub(crate) struct ArtifactBuild<'a> {
  store: &'a BuildStore,
  spec: BuildSpec,
  id: ArtifactId,
}

impl<'a> ArtifactBuild<'a> {
  pub(crate) fn new(store: &'a BuildStore, spec: BuildSpec, id: ArtifactId) -> Self {
    Self { store, spec, id }
  }

  pub(crate) async fn run(&self, source_cache: &dyn SourceCache) -> Result<PathBuf, StoreError> {
    let (artifact_dir, artifact_link) = self.claim_artifact_dir()?;
    match self.build_to(&artifact_dir, source_cache).await {
      Ok(()) => {
        info!(artifact = %self.id.shortened(SHORT_DIGEST_LEN), path = %artifact_dir.display(), "artifact built");
        Ok(artifact_dir)
      }
      Err(e) => {
        // a failed build leaves nothing behind in the artifact root
        let _ = fs::remove_dir_all(&artifact_dir);
        let _ = fs::remove_file(&artifact_link);
        Err(e)
      }
    }
  }

  /// Create the artifact directory under a short digest prefix, lengthening
  /// the prefix past colliding entries, and commit to it with a full-digest
  /// symlink. A full-digest symlink that already exists means a concurrent
  /// build of the same artifact.
  fn claim_artifact_dir(&self) -> Result<(PathBuf, PathBuf), StoreError> {
    let parent = self.store.artifact_root().join(&self.id.name).join(&self.id.version);
    fs::create_dir_all(&parent)?;
    let link = parent.join(&self.id.digest);

    let mut len = SHORT_DIGEST_LEN;
    let artifact_dir = loop {
      if len >= self.id.digest.len() {
        return Err(StoreError::StoreRace(self.id.clone()));
      }
      let candidate = parent.join(&self.id.digest[..len]);
      match fs::create_dir(&candidate) {
        Ok(()) => break candidate,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
          if link.symlink_metadata().is_ok() {
            return Err(StoreError::StoreRace(self.id.clone()));
          }
          // a different digest shares this prefix; use one more character
          len += 1;
        }
        Err(e) => return Err(e.into()),
      }
    };

    let short_name = artifact_dir.file_name().unwrap_or_default().to_os_string();
    if let Err(e) = std::os::unix::fs::symlink(&short_name, &link) {
      let _ = fs::remove_dir(&artifact_dir);
      if e.kind() == io::ErrorKind::AlreadyExists {
        return Err(StoreError::StoreRace(self.id.clone()));
      }
      return Err(e.into());
    }
    Ok((artifact_dir, link))
  }

  fn claim_build_dir(&self) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(self.store.build_root())?;
    let base = format!(
      "{}-{}-{}",
      self.id.name,
      self.id.version,
      &self.id.digest[..SHORT_DIGEST_LEN]
    );
    let mut candidate = self.store.build_root().join(&base);
    let mut attempt = 0;
    loop {
      match fs::create_dir(&candidate) {
        Ok(()) => return Ok(candidate),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
          attempt += 1;
          candidate = self.store.build_root().join(format!("{base}-{attempt}"));
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  async fn build_to(
    &self,
    artifact_dir: &Path,
    source_cache: &dyn SourceCache,
  ) -> Result<(), StoreError> {
    let build_dir = self.claim_build_dir()?;
    debug!(build_dir = %build_dir.display(), "build directory ready");

    // failures before the script runs never keep the build directory
    if let Err(e) = self.prepare(&build_dir, artifact_dir, source_cache) {
      let _ = fs::remove_dir_all(&build_dir);
      return Err(e);
    }

    match self.run_script(&build_dir, artifact_dir).await {
      Ok(()) => {
        fs::copy(build_dir.join(BUILD_LOG_FILE), artifact_dir.join(BUILD_LOG_FILE))?;
        if self.store.keep_policy() != KeepBuildPolicy::Always {
          fs::remove_dir_all(&build_dir)?;
        }
        Ok(())
      }
      Err(e) => {
        let kept = if self.store.keep_policy() == KeepBuildPolicy::Never {
          let _ = fs::remove_dir_all(&build_dir);
          None
        } else {
          warn!(build_dir = %build_dir.display(), "failed build directory kept");
          Some(build_dir)
        };
        Err(StoreError::BuildFailed {
          id: self.id.clone(),
          reason: e.to_string(),
          build_dir: kept,
        })
      }
    }
  }

  fn prepare(
    &self,
    build_dir: &Path,
    artifact_dir: &Path,
    source_cache: &dyn SourceCache,
  ) -> Result<(), StoreError> {
    self.write_spec(build_dir)?;
    self.write_spec(artifact_dir)?;
    self.write_files(build_dir)?;
    self.unpack_sources(build_dir, source_cache)?;
    Ok(())
  }

  fn write_spec(&self, dir: &Path) -> Result<(), StoreError> {
    let mut text = serde_json::to_string_pretty(&self.spec).map_err(hdist_core::SpecError::from)?;
    text.push('\n');
    fs::write(dir.join(BUILD_SPEC_FILE), text)?;
    Ok(())
  }

  fn write_files(&self, build_dir: &Path) -> Result<(), StoreError> {
    for file in &self.spec.files {
      let path = confine(build_dir, &file.target)?;
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
      }
      let contents = if let Some(lines) = &file.contents {
        let mut text = lines.join("\n");
        text.push('\n');
        text
      } else if let Some(object) = &file.object {
        let mut text =
          serde_json::to_string_pretty(object).map_err(hdist_core::SpecError::from)?;
        text.push('\n');
        text
      } else {
        String::new()
      };
      fs::write(path, contents)?;
    }
    Ok(())
  }

  fn unpack_sources(
    &self,
    build_dir: &Path,
    source_cache: &dyn SourceCache,
  ) -> Result<(), StoreError> {
    for source in &self.spec.sources {
      let target = confine(build_dir, &source.target)?;
      fs::create_dir_all(&target)?;
      debug!(key = %source.key, target = %target.display(), "unpacking source");
      source_cache.unpack(&source.key, &target, true)?;
    }
    Ok(())
  }

  async fn run_script(&self, build_dir: &Path, artifact_dir: &Path) -> Result<(), StoreError> {
    let log_path = build_dir.join(BUILD_LOG_FILE);
    let sink = Arc::new(FileSink::create(&log_path)?);
    info!(
      artifact = %self.id.shortened(SHORT_DIGEST_LEN),
      log = %log_path.display(),
      "building artifact, follow log with tail -f"
    );
    let initial_env = BTreeMap::from([
      ("BUILD".to_string(), build_dir.display().to_string()),
      ("ARTIFACT".to_string(), artifact_dir.display().to_string()),
      ("PREFIX".to_string(), artifact_dir.display().to_string()),
    ]);
    let job = JobSpec {
      imports: self.spec.dependencies.clone(),
      env: self.spec.env.clone(),
      env_nohash: self.spec.env_nohash.clone(),
      script: self.spec.script.clone(),
    };
    run_job(
      sink,
      self.store,
      &job,
      &initial_env,
      self.store.virtuals(),
      build_dir,
      &JobOptions::default(),
    )
    .await?;
    Ok(())
  }
}

/// Resolve `target` relative to `base`, rejecting absolute paths and any
/// traversal that leaves `base`.
fn confine(base: &Path, target: &str) -> Result<PathBuf, StoreError> {
  let rel = Path::new(target);
  if rel.is_absolute() {
    return Err(StoreError::TargetEscape(target.to_string()));
  }
  let mut depth: i64 = 0;
  for component in rel.components() {
    match component {
      Component::Normal(_) => depth += 1,
      Component::CurDir => {}
      Component::ParentDir => {
        depth -= 1;
        if depth < 0 {
          return Err(StoreError::TargetEscape(target.to_string()));
        }
      }
      _ => return Err(StoreError::TargetEscape(target.to_string())),
    }
  }
  Ok(base.join(rel))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn confine_accepts_inside_paths() {
    let base = Path::new("/b");
    assert_eq!(confine(base, ".").unwrap(), Path::new("/b/."));
    assert_eq!(confine(base, "sub/dir").unwrap(), Path::new("/b/sub/dir"));
    assert_eq!(confine(base, "a/../b").unwrap(), Path::new("/b/a/../b"));
  }

  #[test]
  fn confine_rejects_escapes() {
    let base = Path::new("/b");
    for bad in ["..", "../x", "a/../../x", "/etc/passwd"] {
      assert!(matches!(confine(base, bad), Err(StoreError::TargetEscape(_))), "{bad:?}");
    }
  }
}
