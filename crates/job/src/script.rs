//! The job script interpreter.
//!
//! A script is a list of argv-style commands plus nested groups that open a
//! new variable scope. The first token of each line decides what it is,
//! checked in this order:
//!
//! - `VAR=$(cmd` — run `cmd`, capture stdout into `VAR` (the line's last
//!   argument must be `)`)
//! - `VAR=value` — assign into the current scope
//! - `cmd>file` — run `cmd` with stdout appended to `file`
//! - anything else — run it as a command
//!
//! A leading `@` suppresses environment logging for that line. Lines whose
//! command is `hdist` are handled in-process: `hdist logpipe` registers a
//! named pipe and `hdist build-profile push|pop` manages profile links.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use hdist_core::{DependencySpec, ScriptNode};

use crate::env::{ArtifactResolver, JobEnvironment, build_environment};
use crate::error::JobError;
use crate::logsink::{LogLevel, LogSink};
use crate::multiplex::{self, CommandOutcome, DEFAULT_PIPE_BUF, RegisteredPipe, StdoutMode};
use crate::profile::ProfileStack;
use crate::subst::substitute;

/// The executable part of a build spec: what to import and what to run.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
  pub imports: Vec<DependencySpec>,
  pub env: BTreeMap<String, String>,
  pub env_nohash: BTreeMap<String, String>,
  pub script: Vec<ScriptNode>,
}

#[derive(Debug, Clone)]
pub struct JobOptions {
  /// Read buffer size per log channel, in bytes. Small values are only
  /// useful to stress partial-line reassembly in tests.
  pub pipe_buf: usize,
}

impl Default for JobOptions {
  fn default() -> Self {
    Self { pipe_buf: DEFAULT_PIPE_BUF }
  }
}

/// Run a job to completion and return the root scope's final environment.
///
/// The job sees only the computed environment, never the caller's. All
/// subprocess output flows to `sink`. Named pipes registered during the run
/// live in a temporary directory that is removed afterwards, and a
/// `build-profile push` left open at the end fails the job.
pub async fn run_job(
  sink: Arc<dyn LogSink>,
  resolver: &dyn ArtifactResolver,
  job: &JobSpec,
  initial_env: &BTreeMap<String, String>,
  virtuals: &BTreeMap<String, String>,
  cwd: &Path,
  options: &JobOptions,
) -> Result<BTreeMap<String, String>, JobError> {
  let JobEnvironment { mut env, import_dirs } = build_environment(
    resolver,
    &job.imports,
    virtuals,
    &job.env,
    &job.env_nohash,
    initial_env,
    cwd,
  )?;
  let mut execution = ScriptExecution::new(sink, cwd.to_path_buf(), import_dirs, options.clone())?;
  execution.run_scope(&job.script, &mut env).await?;
  if !execution.profile.is_balanced() {
    return Err(JobError::ProfileUnbalanced);
  }
  Ok(env)
}

struct ScriptExecution {
  sink: Arc<dyn LogSink>,
  cwd: PathBuf,
  /// Holds the logpipe FIFOs; removed when the execution is dropped.
  rpc_dir: TempDir,
  rpc_dir_resolved: PathBuf,
  pipes: Vec<RegisteredPipe>,
  pipe_index: HashMap<(String, LogLevel), usize>,
  import_dirs: Vec<(String, PathBuf)>,
  profile: ProfileStack,
  options: JobOptions,
}

impl ScriptExecution {
  fn new(
    sink: Arc<dyn LogSink>,
    cwd: PathBuf,
    import_dirs: Vec<(String, PathBuf)>,
    options: JobOptions,
  ) -> Result<Self, JobError> {
    let rpc_dir = tempfile::Builder::new().prefix("hdist-job-").tempdir()?;
    let rpc_dir_resolved = rpc_dir.path().canonicalize()?;
    Ok(Self {
      sink,
      cwd,
      rpc_dir,
      rpc_dir_resolved,
      pipes: Vec::new(),
      pipe_index: HashMap::new(),
      import_dirs,
      profile: ProfileStack::new(),
      options,
    })
  }

  /// Run one scope. Groups get a clone of the environment, so their
  /// assignments vanish when the group ends.
  fn run_scope<'a>(
    &'a mut self,
    nodes: &'a [ScriptNode],
    env: &'a mut BTreeMap<String, String>,
  ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), JobError>> + 'a>> {
    Box::pin(async move {
      for node in nodes {
        match node {
          ScriptNode::Group(inner) => {
            let mut scoped = env.clone();
            self.run_scope(inner, &mut scoped).await?;
          }
          ScriptNode::Command(argv) => {
            if argv.is_empty() {
              continue;
            }
            self.run_line(argv, env).await?;
          }
        }
      }
      Ok(())
    })
  }

  async fn run_line(
    &mut self,
    argv: &[String],
    env: &mut BTreeMap<String, String>,
  ) -> Result<(), JobError> {
    let head = argv[0].as_str();
    let (silent, head) = match head.strip_prefix('@') {
      Some(rest) => (true, rest),
      None => (false, head),
    };

    if let Some((var, cmd_part)) = head.split_once("=$(") {
      let mut args = self.substitute_args(&argv[1..], env)?;
      if args.last().map(String::as_str) != Some(")") {
        return Err(JobError::UnbalancedCapture(argv.join(" ")));
      }
      args.pop();
      let cmd = substitute(cmd_part, env)?;
      let output = if cmd == "hdist" {
        self.run_builtin(&args, env)?
      } else {
        let outcome = self.spawn(&cmd, &args, env, StdoutMode::Capture, silent).await?;
        outcome.captured.unwrap_or_default()
      };
      // whitespace in captured output collapses to single spaces
      let value = output.split_whitespace().collect::<Vec<_>>().join(" ");
      env.insert(var.to_string(), value);
    } else if let Some((var, value)) = head.split_once('=') {
      if argv.len() > 1 {
        return Err(JobError::AssignmentWithArgs(argv.join(" ")));
      }
      let value = substitute(value, env)?;
      env.insert(var.to_string(), value);
    } else if let Some((cmd_part, file_part)) = head.split_once('>') {
      let cmd = substitute(cmd_part, env)?;
      let args = self.substitute_args(&argv[1..], env)?;
      let filename = substitute(file_part, env)?;
      let mut path = PathBuf::from(&filename);
      if path.is_relative() {
        path = self.cwd.join(path);
      }
      if self.resolves_into_rpc_dir(&path) {
        return Err(JobError::LogPipeRedirect);
      }
      let file =
        std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
      self.spawn(&cmd, &args, env, StdoutMode::File(file), silent).await?;
    } else {
      let cmd = substitute(head, env)?;
      let args = self.substitute_args(&argv[1..], env)?;
      if cmd == "hdist" {
        let output = self.run_builtin(&args, env)?;
        if !output.is_empty() {
          debug!(%output, "hdist builtin output");
        }
      } else {
        self.spawn(&cmd, &args, env, StdoutMode::Log, silent).await?;
      }
    }
    Ok(())
  }

  fn substitute_args(
    &self,
    args: &[String],
    env: &BTreeMap<String, String>,
  ) -> Result<Vec<String>, JobError> {
    args.iter().map(|arg| substitute(arg, env).map_err(JobError::from)).collect()
  }

  /// Redirect targets are resolved through their parent directory, so a
  /// symlink pointing into the logpipe directory is caught too.
  fn resolves_into_rpc_dir(&self, path: &Path) -> bool {
    let resolved = match (path.parent(), path.file_name()) {
      (Some(parent), Some(name)) => {
        parent.canonicalize().map(|p| p.join(name)).unwrap_or_else(|_| path.to_path_buf())
      }
      _ => path.to_path_buf(),
    };
    resolved.starts_with(&self.rpc_dir_resolved)
  }

  /// In-process `hdist` verbs. Returns the verb's output text, if any.
  fn run_builtin(
    &mut self,
    args: &[String],
    env: &BTreeMap<String, String>,
  ) -> Result<String, JobError> {
    match args.first().map(String::as_str) {
      Some("logpipe") => {
        let (name, level) = match args {
          [_, name, level] => (name.clone(), LogLevel::from_str(level)?),
          _ => return Err(JobError::LogPipeUsage),
        };
        Ok(self.attach_log_pipe(name, level)?)
      }
      Some("build-profile") => {
        match args.get(1).map(String::as_str) {
          Some("push") if args.len() == 2 => {
            let target = env
              .get("ARTIFACT")
              .ok_or_else(|| crate::subst::SubstError::Unbound("ARTIFACT".to_string()))?
              .clone();
            self.profile.push(&self.import_dirs, Path::new(&target))?;
            Ok(String::new())
          }
          Some("pop") if args.len() == 2 => {
            self.profile.pop()?;
            Ok(String::new())
          }
          _ => Err(JobError::UnsupportedBuiltin(format!("hdist {}", args.join(" ")))),
        }
      }
      _ => Err(JobError::UnsupportedBuiltin(format!("hdist {}", args.join(" ")))),
    }
  }

  /// Create (or reuse) the FIFO for `(name, level)` and return its path.
  fn attach_log_pipe(&mut self, name: String, level: LogLevel) -> Result<String, JobError> {
    let key = (name.clone(), level);
    if let Some(&index) = self.pipe_index.get(&key) {
      return Ok(self.pipes[index].path.display().to_string());
    }
    let path = self.rpc_dir.path().join(format!("logpipe-{name}-{level}"));
    nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
      .map_err(io::Error::from)?;
    let display = path.display().to_string();
    self.pipe_index.insert(key, self.pipes.len());
    self.pipes.push(RegisteredPipe { name, level, path });
    Ok(display)
  }

  async fn spawn(
    &self,
    cmd: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    stdout: StdoutMode,
    silent: bool,
  ) -> Result<CommandOutcome, JobError> {
    debug!(cmd, ?args, cwd = %self.cwd.display(), "running command");
    if !silent {
      debug!(?env, "command environment");
    }
    let mut command = Command::new(cmd);
    command.args(args).current_dir(&self.cwd).env_clear().envs(env);
    let outcome = multiplex::run_logged(
      command,
      stdout,
      &self.pipes,
      self.sink.clone(),
      self.options.pipe_buf,
    )
    .await
    .map_err(|e| {
      if e.kind() == io::ErrorKind::NotFound {
        JobError::CommandNotFound {
          cmd: cmd.to_string(),
          cwd: self.cwd.display().to_string(),
        }
      } else {
        JobError::Io(e)
      }
    })?;
    if !outcome.status.success() {
      tracing::error!(cmd, code = ?outcome.status.code(), "command failed");
      return Err(JobError::CommandFailed {
        cmd: cmd.to_string(),
        code: outcome.status.code(),
      });
    }
    Ok(outcome)
  }
}
