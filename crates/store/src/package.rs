//! The package-level front of the store: named packages with inter-package
//! dependencies, built in dependency order.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use hdist_core::{ArtifactId, BuildSpec, stable_topological_sort};

use crate::error::StoreError;
use crate::source::SourceCache;
use crate::store::BuildStore;

/// How a package's build spec was produced. Purely descriptive; the store
/// builds every kind the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecipeKind {
  ConfigureMakeInstall,
  NonhashedHostSymlinks,
  Profile,
  CustomScript,
}

/// A named package: a build spec plus the package-level dependency edges
/// used to order builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
  pub name: String,
  pub recipe: RecipeKind,
  pub spec: BuildSpec,

  /// Packages that must be built before this one.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub build_deps: Vec<String>,

  /// Ordering-only edges, honored when the named package is in the set.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub soft_deps: Vec<String>,

  /// Free-form attributes carried through from the package definition.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Build every package, dependencies first, and return each package's
/// artifact keyed by package name.
///
/// `build_deps` must name packages in the set; `soft_deps` naming absent
/// packages are ignored.
pub async fn build_packages(
  store: &BuildStore,
  packages: Vec<Package>,
  source_cache: &dyn SourceCache,
) -> Result<BTreeMap<String, (ArtifactId, PathBuf)>, StoreError> {
  let known: HashSet<String> = packages.iter().map(|p| p.name.clone()).collect();

  struct Entry {
    package: Package,
    after: Vec<String>,
  }
  let entries = packages
    .into_iter()
    .map(|package| {
      let mut after = package.build_deps.clone();
      after.extend(package.soft_deps.iter().filter(|d| known.contains(*d)).cloned());
      Entry { package, after }
    })
    .collect();

  let ordered =
    stable_topological_sort(entries, |entry| entry.package.name.as_str(), |entry| &entry.after)?;

  let mut built = BTreeMap::new();
  for entry in ordered {
    let package = entry.package;
    info!(package = %package.name, recipe = ?package.recipe, "building package");
    let (id, path) = store.ensure_present(&package.spec, source_cache).await?;
    built.insert(package.name, (id, path));
  }
  Ok(built)
}
