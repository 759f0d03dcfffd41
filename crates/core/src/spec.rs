//! The build specification model and artifact identities.
//!
//! A `BuildSpec` is a declarative, JSON-shaped document: what to import, what
//! sources to unpack, what small files to embed, and what script to run. Its
//! canonical form is unique per semantic content, and the artifact ID is a
//! pure function of that canonical form — deriving an ID never touches the
//! filesystem or a clock.
//!
//! An artifact ID has the form `name/version/digest`, e.g.
//! `zlib/1-2-7/fXHu+8dcqmREfXaz+ixMkh2LQbvIKlHf+rtl5HEfgmU`. On disk a
//! shortened digest prefix is used for friendliness; that is the store's
//! concern, not this module's.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hasher::DocumentHasher;

/// Prefix marking a dependency ID as virtual: a user-controlled placeholder
/// that is hashed literally and resolved to a concrete artifact only at
/// build time.
pub const VIRTUAL_PREFIX: &str = "virtual:";

/// Errors raised while validating or hashing a build specification.
#[derive(Debug, Error)]
pub enum SpecError {
  #[error("\"{0}\" is empty or contains characters outside [A-Za-z0-9-_+]")]
  UnsafeName(String),

  #[error("malformed artifact id: {0}")]
  MalformedId(String),

  #[error("failed to serialize build spec: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// A declarative build specification.
///
/// `dependencies` and `script` are order-sensitive (their order affects the
/// hash); `sources` and `files` are sets and are sorted during
/// canonicalization. `env` participates in the hash, `env_nohash` does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
  pub name: String,
  pub version: String,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<DependencySpec>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub sources: Vec<SourceSpec>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub files: Vec<FileSpec>,

  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,

  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env_nohash: BTreeMap<String, String>,

  #[serde(default, alias = "command", skip_serializing_if = "Vec::is_empty")]
  pub script: Vec<ScriptNode>,
}

/// A build-time dependency on another artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
  /// Name used to inject this dependency into the build environment
  /// (`$REF`, `$REF_abspath`, `$REF_relpath`).
  #[serde(rename = "ref")]
  pub ref_name: String,

  /// Artifact ID, or a `virtual:` placeholder.
  pub id: String,

  /// IDs this dependency must come after in `$PATH` and profile ordering.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub after: Vec<String>,
}

impl DependencySpec {
  pub fn is_virtual(&self) -> bool {
    self.id.starts_with(VIRTUAL_PREFIX)
  }
}

/// A source archive to unpack into the build directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
  /// Source-cache key (e.g. `tar.gz:<hash>` or `git:<commit>`).
  pub key: String,

  /// Directory to unpack into, relative to the build directory.
  #[serde(default = "default_source_target")]
  pub target: String,

  /// Leading path components to strip (tarballs only).
  #[serde(default)]
  pub strip: u32,
}

fn default_source_target() -> String {
  ".".to_string()
}

/// A small file embedded in-line in the spec, written into the build
/// directory before the script runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSpec {
  /// Target path relative to the build directory.
  pub target: String,

  /// Text content as a list of lines (joined with `\n`, trailing newline).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub contents: Option<Vec<String>>,

  /// Arbitrary JSON content, written pretty-printed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub object: Option<Value>,
}

/// One node of a job script: an argv-style command, or a nested group
/// forming a new variable scope.
///
/// In JSON a command is a list of strings and a group is a list of lists;
/// mixing the two at one level is a deserialization error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptNode {
  Command(Vec<String>),
  Group(Vec<ScriptNode>),
}

impl BuildSpec {
  /// Return the canonical form: defaults filled in (serde already fills
  /// `target`/`strip`), order-insensitive lists sorted, names validated.
  ///
  /// Canonicalization is idempotent and deterministic.
  pub fn canonicalize(&self) -> Result<BuildSpec, SpecError> {
    assert_safe_name(&self.name)?;
    assert_safe_name(&self.version)?;

    let mut spec = self.clone();
    spec.sources.sort_by(|a, b| a.key.cmp(&b.key));
    spec.files.sort_by(|a, b| a.target.cmp(&b.target));
    for dep in &mut spec.dependencies {
      dep.after.sort();
    }
    Ok(spec)
  }

  /// Derive the artifact ID for this spec.
  ///
  /// The hash input is the canonical spec with `env_nohash` removed; virtual
  /// dependency IDs are hashed as their literal placeholder strings.
  pub fn artifact_id(&self) -> Result<ArtifactId, SpecError> {
    let canonical = self.canonicalize()?;
    let mut doc = serde_json::to_value(&canonical)?;
    if let Value::Object(map) = &mut doc {
      map.remove("env_nohash");
    }
    let digest = DocumentHasher::of(&doc).format_digest();
    Ok(ArtifactId {
      name: canonical.name,
      version: canonical.version,
      digest,
    })
  }
}

/// The identity of a built artifact: `name/version/digest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactId {
  pub name: String,
  pub version: String,
  pub digest: String,
}

impl ArtifactId {
  /// The id with the digest truncated to `digest_len` characters, as used
  /// for on-disk directory names.
  pub fn shortened(&self, digest_len: usize) -> String {
    let len = digest_len.min(self.digest.len());
    format!("{}/{}/{}", self.name, self.version, &self.digest[..len])
  }
}

impl fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.name, self.version, self.digest)
  }
}

impl FromStr for ArtifactId {
  type Err = SpecError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut parts = s.split('/');
    let (name, version, digest) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some(n), Some(v), Some(d), None) => (n, v, d),
      _ => return Err(SpecError::MalformedId(s.to_string())),
    };
    assert_safe_name(name)?;
    assert_safe_name(version)?;
    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
    {
      return Err(SpecError::MalformedId(s.to_string()));
    }
    Ok(ArtifactId {
      name: name.to_string(),
      version: version.to_string(),
      digest: digest.to_string(),
    })
  }
}

impl TryFrom<String> for ArtifactId {
  type Error = SpecError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

impl From<ArtifactId> for String {
  fn from(id: ArtifactId) -> String {
    id.to_string()
  }
}

/// Validate that a name/version matches `[A-Za-z0-9-_+]+`.
pub fn assert_safe_name(s: &str) -> Result<(), SpecError> {
  let ok = !s.is_empty()
    && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '+');
  if ok { Ok(()) } else { Err(SpecError::UnsafeName(s.to_string())) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn simple_spec() -> BuildSpec {
    serde_json::from_value(json!({
      "name": "foo",
      "version": "r0",
      "sources": [
        {"key": "tar.gz:bbb", "target": "sub", "strip": 1},
        {"key": "tar.gz:aaa"},
      ],
      "files": [
        {"target": "b.sh", "contents": ["echo b"]},
        {"target": "a.sh", "contents": ["echo a"]},
      ],
      "dependencies": [
        {"ref": "zlib", "id": "zlib/1.2.7/fXHu"},
        {"ref": "bash", "id": "virtual:bash"},
      ],
      "script": [["bash", "a.sh"]],
    }))
    .unwrap()
  }

  #[test]
  fn canonicalize_fills_defaults_and_sorts() {
    let canonical = simple_spec().canonicalize().unwrap();
    assert_eq!(canonical.sources[0].key, "tar.gz:aaa");
    assert_eq!(canonical.sources[0].target, ".");
    assert_eq!(canonical.sources[0].strip, 0);
    assert_eq!(canonical.sources[1].key, "tar.gz:bbb");
    assert_eq!(canonical.files[0].target, "a.sh");
    assert_eq!(canonical.files[1].target, "b.sh");
  }

  #[test]
  fn canonicalize_is_idempotent() {
    let once = simple_spec().canonicalize().unwrap();
    let twice = once.canonicalize().unwrap();
    assert_eq!(once, twice);
  }

  #[test]
  fn set_order_does_not_affect_hash() {
    let a = simple_spec();
    let mut b = simple_spec();
    b.sources.reverse();
    b.files.reverse();
    assert_eq!(a.artifact_id().unwrap(), b.artifact_id().unwrap());
  }

  #[test]
  fn dependency_order_affects_hash() {
    let a = simple_spec();
    let mut b = simple_spec();
    b.dependencies.reverse();
    assert_ne!(a.artifact_id().unwrap().digest, b.artifact_id().unwrap().digest);
  }

  #[test]
  fn script_order_affects_hash() {
    let mut a = simple_spec();
    a.script = vec![
      ScriptNode::Command(vec!["make".into()]),
      ScriptNode::Command(vec!["make".into(), "install".into()]),
    ];
    let mut b = a.clone();
    b.script.reverse();
    assert_ne!(a.artifact_id().unwrap().digest, b.artifact_id().unwrap().digest);
  }

  #[test]
  fn env_affects_hash_but_env_nohash_does_not() {
    let base = simple_spec();
    let mut hashed = simple_spec();
    hashed.env.insert("CFLAGS".into(), "-O2".into());
    let mut nohash = simple_spec();
    nohash.env_nohash.insert("NCORES".into(), "16".into());

    assert_ne!(base.artifact_id().unwrap().digest, hashed.artifact_id().unwrap().digest);
    assert_eq!(base.artifact_id().unwrap().digest, nohash.artifact_id().unwrap().digest);
  }

  #[test]
  fn digest_is_stable_43_chars() {
    let id = simple_spec().artifact_id().unwrap();
    assert_eq!(id.digest.len(), 43);
    assert_eq!(id, simple_spec().artifact_id().unwrap());
  }

  #[test]
  fn unsafe_names_are_rejected() {
    for bad in ["", "with space", "slash/y", "dot.dot", ".."] {
      let mut spec = simple_spec();
      spec.name = bad.to_string();
      assert!(matches!(spec.artifact_id(), Err(SpecError::UnsafeName(_))), "{bad:?}");
    }
    // version is validated too
    let mut spec = simple_spec();
    spec.version = "1.2".to_string();
    assert!(spec.artifact_id().is_err());
  }

  #[test]
  fn command_is_accepted_as_script_alias() {
    let spec: BuildSpec = serde_json::from_value(json!({
      "name": "foo",
      "version": "n",
      "command": [["/bin/echo", "hi"]],
    }))
    .unwrap();
    assert_eq!(spec.script, vec![ScriptNode::Command(vec!["/bin/echo".into(), "hi".into()])]);
  }

  #[test]
  fn script_nesting_parses() {
    let spec: BuildSpec = serde_json::from_value(json!({
      "name": "foo",
      "version": "n",
      "script": [
        [["LIB=foo"], ["./configure", "--prefix=$ARTIFACT"]],
        ["make", "install"],
      ],
    }))
    .unwrap();
    match &spec.script[0] {
      ScriptNode::Group(inner) => assert_eq!(inner.len(), 2),
      other => panic!("expected group, got {other:?}"),
    }
    assert!(matches!(&spec.script[1], ScriptNode::Command(_)));
  }

  #[test]
  fn artifact_id_roundtrips_through_display() {
    let id = simple_spec().artifact_id().unwrap();
    let parsed: ArtifactId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
  }

  #[test]
  fn malformed_artifact_ids_are_rejected() {
    for bad in ["foo", "foo/1.2", "foo/bar/baz/extra", "foo/bar/", "a b/c/d"] {
      assert!(bad.parse::<ArtifactId>().is_err(), "{bad:?}");
    }
  }

  #[test]
  fn shortened_id_truncates_digest_only() {
    let id = ArtifactId {
      name: "zlib".into(),
      version: "1-2-7".into(),
      digest: "fXHu+8dcqmREfXaz".into(),
    };
    assert_eq!(id.shortened(4), "zlib/1-2-7/fXHu");
    assert_eq!(id.shortened(999), "zlib/1-2-7/fXHu+8dcqmREfXaz");
  }

  #[test]
  fn virtual_dependencies_are_flagged() {
    let spec = simple_spec();
    assert!(spec.dependencies.iter().any(|d| d.is_virtual()));
    assert!(!spec.dependencies[0].is_virtual());
  }
}
