//! Temporary profile link transactions.
//!
//! `hdist build-profile push` symlinks every file from the job's import
//! artifacts into `$ARTIFACT`, so a build can use its dependencies through a
//! single merged prefix. Each push is journaled: the matching `pop` removes
//! exactly the links it created, plus any directory it created that is now
//! empty. Files the build wrote in between are untouched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::JobError;

const SKIPPED_TOP_LEVEL: &[&str] = &["build.json", "build.log"];

struct Frame {
  links: Vec<PathBuf>,
  created_dirs: Vec<PathBuf>,
}

/// Journal of open `build-profile push` transactions.
#[derive(Default)]
pub struct ProfileStack {
  frames: Vec<Frame>,
}

impl ProfileStack {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_balanced(&self) -> bool {
    self.frames.is_empty()
  }

  /// Link every file of every import into `target`, journaling what was
  /// created. A failure part-way rolls the partial frame back.
  pub fn push(&mut self, imports: &[(String, PathBuf)], target: &Path) -> Result<(), JobError> {
    let mut frame = Frame { links: Vec::new(), created_dirs: Vec::new() };
    for (ref_name, dir) in imports {
      debug!(import = %ref_name, from = %dir.display(), to = %target.display(), "linking import");
      if let Err(e) = link_tree(dir, target, &mut frame) {
        undo_frame(&frame);
        return Err(e);
      }
    }
    self.frames.push(frame);
    Ok(())
  }

  /// Undo the most recent push.
  pub fn pop(&mut self) -> Result<(), JobError> {
    let frame = self.frames.pop().ok_or(JobError::ProfileUnderflow)?;
    for link in frame.links.iter().rev() {
      match fs::remove_file(link) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
    }
    for dir in frame.created_dirs.iter().rev() {
      match fs::remove_dir(dir) {
        Ok(()) => {}
        // the build put its own files there, so the directory stays
        Err(e)
          if e.kind() == io::ErrorKind::DirectoryNotEmpty
            || e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }
}

fn link_tree(source: &Path, target: &Path, frame: &mut Frame) -> Result<(), JobError> {
  for entry in WalkDir::new(source).min_depth(1) {
    let entry = entry.map_err(io::Error::from)?;
    if !entry.file_type().is_file() && !entry.file_type().is_symlink() {
      continue;
    }
    let rel = entry
      .path()
      .strip_prefix(source)
      .map_err(|_| io::Error::other("walkdir escaped its root"))?;
    if entry.depth() == 1
      && rel.to_str().map(|name| SKIPPED_TOP_LEVEL.contains(&name)).unwrap_or(false)
    {
      continue;
    }
    let dest = target.join(rel);
    if let Some(parent) = dest.parent() {
      ensure_dir(parent, target, frame)?;
    }
    if dest.symlink_metadata().is_ok() {
      return Err(JobError::ProfileConflict(dest.display().to_string()));
    }
    std::os::unix::fs::symlink(entry.path(), &dest)?;
    frame.links.push(dest);
  }
  Ok(())
}

/// Create `dir` (and any missing ancestors below `root`), journaling each
/// directory this call created.
fn ensure_dir(dir: &Path, root: &Path, frame: &mut Frame) -> Result<(), JobError> {
  if dir == root || dir.is_dir() {
    return Ok(());
  }
  if let Some(parent) = dir.parent() {
    ensure_dir(parent, root, frame)?;
  }
  match fs::create_dir(dir) {
    Ok(()) => {
      frame.created_dirs.push(dir.to_path_buf());
      Ok(())
    }
    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
    Err(e) => Err(e.into()),
  }
}

fn undo_frame(frame: &Frame) {
  for link in frame.links.iter().rev() {
    let _ = fs::remove_file(link);
  }
  for dir in frame.created_dirs.iter().rev() {
    let _ = fs::remove_dir(dir);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
  }

  fn import_dir(root: &Path, name: &str) -> (String, PathBuf) {
    (name.to_string(), root.join(name))
  }

  #[test]
  fn push_links_files_and_pop_removes_them() {
    let tmp = tempfile::tempdir().unwrap();
    let zlib = tmp.path().join("zlib");
    write(&zlib.join("bin/tool"), "#!/bin/sh\n");
    write(&zlib.join("lib/libz.so"), "");
    write(&zlib.join("build.json"), "{}");
    let artifact = tmp.path().join("artifact");
    fs::create_dir(&artifact).unwrap();

    let mut stack = ProfileStack::new();
    stack.push(&[import_dir(tmp.path(), "zlib")], &artifact).unwrap();

    assert!(artifact.join("bin/tool").symlink_metadata().unwrap().file_type().is_symlink());
    assert!(artifact.join("lib/libz.so").exists());
    // build.json at the import's top level is never linked
    assert!(!artifact.join("build.json").exists());
    assert!(!stack.is_balanced());

    stack.pop().unwrap();
    assert!(stack.is_balanced());
    assert!(!artifact.join("bin").exists());
    assert!(!artifact.join("lib").exists());
  }

  #[test]
  fn pop_keeps_directories_the_build_used() {
    let tmp = tempfile::tempdir().unwrap();
    let zlib = tmp.path().join("zlib");
    write(&zlib.join("bin/tool"), "");
    let artifact = tmp.path().join("artifact");
    fs::create_dir(&artifact).unwrap();

    let mut stack = ProfileStack::new();
    stack.push(&[import_dir(tmp.path(), "zlib")], &artifact).unwrap();
    // the build drops its own file into the linked directory
    write(&artifact.join("bin/own-binary"), "");
    stack.pop().unwrap();

    assert!(!artifact.join("bin/tool").exists());
    assert!(artifact.join("bin/own-binary").exists());
  }

  #[test]
  fn pop_without_push_underflows() {
    let mut stack = ProfileStack::new();
    assert!(matches!(stack.pop(), Err(JobError::ProfileUnderflow)));
  }

  #[test]
  fn conflicting_link_target_fails_and_rolls_back() {
    let tmp = tempfile::tempdir().unwrap();
    let zlib = tmp.path().join("zlib");
    write(&zlib.join("bin/atool"), "");
    write(&zlib.join("bin/tool"), "");
    let artifact = tmp.path().join("artifact");
    write(&artifact.join("bin/tool"), "already here");

    let mut stack = ProfileStack::new();
    let err = stack.push(&[import_dir(tmp.path(), "zlib")], &artifact).unwrap_err();
    assert!(matches!(err, JobError::ProfileConflict(_)));
    assert!(stack.is_balanced());
    // partial links were rolled back, the pre-existing file stayed
    assert!(!artifact.join("bin/atool").exists());
    assert_eq!(fs::read_to_string(artifact.join("bin/tool")).unwrap(), "already here");
  }

  #[test]
  fn nested_pushes_pop_independently() {
    let tmp = tempfile::tempdir().unwrap();
    write(&tmp.path().join("a/share/a.txt"), "");
    write(&tmp.path().join("b/share/b.txt"), "");
    let artifact = tmp.path().join("artifact");
    fs::create_dir(&artifact).unwrap();

    let mut stack = ProfileStack::new();
    stack.push(&[import_dir(tmp.path(), "a")], &artifact).unwrap();
    stack.push(&[import_dir(tmp.path(), "b")], &artifact).unwrap();
    stack.pop().unwrap();
    assert!(artifact.join("share/a.txt").exists());
    assert!(!artifact.join("share/b.txt").exists());
    stack.pop().unwrap();
    assert!(!artifact.join("share").exists());
  }
}
