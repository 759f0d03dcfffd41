use thiserror::Error;

use crate::logsink::UnknownLevel;
use crate::subst::SubstError;

/// Errors raised while building the job environment or running its script.
#[derive(Debug, Error)]
pub enum JobError {
  #[error(transparent)]
  Subst(#[from] SubstError),

  #[error(transparent)]
  Sort(#[from] hdist_core::SortError),

  #[error(transparent)]
  Level(#[from] UnknownLevel),

  #[error("dependency \"{ref_name}\"=\"{id}\" is not already built, please build it first")]
  DependencyNotBuilt { ref_name: String, id: String },

  #[error("no artifact provided for virtual dependency \"{0}\"")]
  VirtualNotProvided(String),

  #[error("command \"{cmd}\" not found in PATH (cwd: {cwd})")]
  CommandNotFound { cmd: String, cwd: String },

  #[error("command \"{cmd}\" failed with code {code:?}")]
  CommandFailed { cmd: String, code: Option<i32> },

  #[error("a variable assignment takes no further arguments: {0}")]
  AssignmentWithArgs(String),

  #[error("command substitution does not end with \")\": {0}")]
  UnbalancedCapture(String),

  #[error("cannot redirect into a log pipe; have the subprocess write to it instead")]
  LogPipeRedirect,

  #[error("usage: hdist logpipe <name> <level>")]
  LogPipeUsage,

  #[error("unsupported hdist builtin: {0}")]
  UnsupportedBuiltin(String),

  #[error("\"hdist build-profile pop\" without a matching push")]
  ProfileUnderflow,

  #[error("\"hdist build-profile push\" still open at the end of the job")]
  ProfileUnbalanced,

  #[error("profile link target already exists: {0}")]
  ProfileConflict(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
