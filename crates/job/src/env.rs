//! Construction of the isolated build environment.
//!
//! A job never inherits the caller's environment. Everything a script can
//! see is derived from the spec: declared variables, plus per-dependency
//! references and the aggregate `PATH` / `HDIST_*` variables computed from
//! the dependency artifacts on disk.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use hdist_core::{DependencySpec, stable_topological_sort};

use crate::error::JobError;

/// Resolves an artifact ID to its directory in a store.
///
/// Only already-built artifacts resolve; a job never triggers a build.
pub trait ArtifactResolver {
  fn resolve_artifact(&self, id: &str) -> Option<PathBuf>;
}

/// The computed environment for one job.
#[derive(Debug)]
pub struct JobEnvironment {
  pub env: BTreeMap<String, String>,
  /// Artifact directory per dependency, in the sorted dependency order used
  /// for `PATH` and profile links.
  pub import_dirs: Vec<(String, PathBuf)>,
}

/// Build the job environment from the declared dependencies and variables.
///
/// Dependencies are put in stable topological order by their `after`
/// constraints; that order drives `PATH` and the `HDIST_*` aggregates.
/// Precedence for plain variables is `initial_env` < `declared_env_nohash` <
/// `declared_env`, so nothing outside the hash can shadow a hashed setting.
pub fn build_environment(
  resolver: &dyn ArtifactResolver,
  dependencies: &[DependencySpec],
  virtuals: &BTreeMap<String, String>,
  declared_env: &BTreeMap<String, String>,
  declared_env_nohash: &BTreeMap<String, String>,
  initial_env: &BTreeMap<String, String>,
  build_dir: &Path,
) -> Result<JobEnvironment, JobError> {
  let ordered =
    stable_topological_sort(dependencies.to_vec(), |d| d.id.as_str(), |d| &d.after)?;

  let mut env = initial_env.clone();
  for (key, value) in declared_env_nohash {
    env.insert(key.clone(), value.clone());
  }
  for (key, value) in declared_env {
    env.insert(key.clone(), value.clone());
  }

  let mut path_entries = Vec::new();
  let mut cflags = Vec::new();
  let mut ldflags = Vec::new();
  let mut imports = Vec::new();
  let mut import_dirs = Vec::new();

  for dep in &ordered {
    imports.push(dep.id.clone());
    let concrete = if dep.is_virtual() {
      virtuals
        .get(&dep.id)
        .ok_or_else(|| JobError::VirtualNotProvided(dep.id.clone()))?
        .clone()
    } else {
      dep.id.clone()
    };
    let dir = resolver.resolve_artifact(&concrete).ok_or_else(|| JobError::DependencyNotBuilt {
      ref_name: dep.ref_name.clone(),
      id: dep.id.clone(),
    })?;

    env.insert(dep.ref_name.clone(), dep.id.clone());
    env.insert(format!("{}_abspath", dep.ref_name), dir.display().to_string());
    env.insert(
      format!("{}_relpath", dep.ref_name),
      relative_path(build_dir, &dir).display().to_string(),
    );

    let bin = dir.join("bin");
    if bin.is_dir() {
      path_entries.push(bin.display().to_string());
    }
    let include = dir.join("include");
    if include.is_dir() {
      cflags.push(format!("-I{}", include.display()));
    }
    for libdir in ["lib", "lib64"] {
      let lib = dir.join(libdir);
      if lib.is_dir() {
        ldflags.push(format!("-L{}", lib.display()));
        ldflags.push(format!("-Wl,-R,{}", lib.display()));
      }
    }
    import_dirs.push((dep.ref_name.clone(), dir));
  }

  env.insert("PATH".to_string(), path_entries.join(":"));
  env.insert("HDIST_CFLAGS".to_string(), cflags.join(" "));
  env.insert("HDIST_LDFLAGS".to_string(), ldflags.join(" "));
  env.insert("HDIST_IMPORT".to_string(), imports.join(" "));
  env.insert("HDIST_VIRTUALS".to_string(), pack_virtuals(virtuals));

  Ok(JobEnvironment { env, import_dirs })
}

/// Encode a virtual-to-concrete mapping as `virtual:a=id-a;virtual:b=id-b`.
pub fn pack_virtuals(virtuals: &BTreeMap<String, String>) -> String {
  virtuals.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(";")
}

/// Express `target` relative to `base`. Both must be absolute; no symlink
/// resolution is attempted.
pub(crate) fn relative_path(base: &Path, target: &Path) -> PathBuf {
  let base_parts: Vec<Component<'_>> = base.components().collect();
  let target_parts: Vec<Component<'_>> = target.components().collect();
  let common =
    base_parts.iter().zip(&target_parts).take_while(|(a, b)| a == b).count();

  let mut out = PathBuf::new();
  for _ in common..base_parts.len() {
    out.push("..");
  }
  for part in &target_parts[common..] {
    out.push(part);
  }
  if out.as_os_str().is_empty() {
    out.push(".");
  }
  out
}
