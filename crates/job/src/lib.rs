//! hdist-job: the job execution engine.
//!
//! Runs the script of a build spec in an isolated, deterministic
//! environment: dependency-derived variables, shell-style substitution, a
//! small in-process `hdist` verb set, and line-granular multiplexing of all
//! subprocess output into a single log sink.
//!
//! Unix only: log pipes are named FIFOs.

pub mod env;
pub mod error;
pub mod logsink;
pub mod multiplex;
pub mod profile;
pub mod script;
pub mod subst;

pub use env::{ArtifactResolver, JobEnvironment, build_environment};
pub use error::JobError;
pub use logsink::{LogLevel, LogRecord, LogSink, MemorySink, TracingSink};
pub use multiplex::DEFAULT_PIPE_BUF;
pub use script::{JobOptions, JobSpec, run_job};
pub use subst::{SubstError, substitute};
