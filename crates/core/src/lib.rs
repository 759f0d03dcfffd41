//! hdist-core: the pure layer of the hdist build orchestrator.
//!
//! This crate holds everything that can be computed without touching the
//! filesystem or spawning processes:
//! - `hasher`: stable document hashing used for content addressing
//! - `spec`: the build specification model, its canonical form, and
//!   artifact IDs derived from it
//! - `sort`: the stable topological sort used to order dependencies and
//!   profile links deterministically

pub mod hasher;
pub mod sort;
pub mod spec;

pub use hasher::{DocumentHasher, format_digest};
pub use sort::{SortError, stable_topological_sort};
pub use spec::{
  ArtifactId, BuildSpec, DependencySpec, FileSpec, ScriptNode, SourceSpec, SpecError,
};
