//! hdist-store: the content-addressed artifact store.
//!
//! An artifact's identity is a pure function of its build spec; the store
//! maps identities to directories on disk and builds the missing ones by
//! running their job scripts through `hdist-job`. Sources come in through
//! the `SourceCache` boundary, and packages layer names and inter-package
//! dependency order on top of raw specs.

pub mod build;
pub mod error;
pub mod package;
pub mod source;
pub mod store;

pub use hdist_core::{ArtifactId, BuildSpec};

pub use build::{BUILD_LOG_FILE, BUILD_SPEC_FILE, FileSink};
pub use error::StoreError;
pub use package::{Package, RecipeKind, build_packages};
pub use source::{SourceCache, SourceCacheError};
pub use store::{BuildStore, KeepBuildPolicy, SHORT_DIGEST_LEN};
