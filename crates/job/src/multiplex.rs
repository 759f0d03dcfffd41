//! Concurrent log multiplexing for job subprocesses.
//!
//! Each command a job runs can produce output on three kinds of channel: its
//! stdout, its stderr, and any number of named pipes registered with
//! `hdist logpipe`. A reader task per channel splits the byte stream into
//! lines and forwards them as `LogRecord`s over a single mpsc channel, so
//! records from concurrent writers interleave at line granularity and every
//! complete line arrives intact. One consumer task delivers them to the
//! `LogSink` in arrival order.
//!
//! Subprocess streams close by themselves when the child exits. A FIFO is
//! different: reading it yields EOF whenever the last *current* writer
//! closes, while a later command (or a concurrent writer mid-job) may still
//! open it again. The FIFO reader therefore reopens on EOF until the command
//! has finished, and only then lets EOF end the task.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::logsink::{LogLevel, LogRecord, LogSink};

/// Default read buffer size per channel, in bytes.
pub const DEFAULT_PIPE_BUF: usize = 4096;

/// A named pipe registered with `hdist logpipe <name> <level>`.
#[derive(Debug, Clone)]
pub struct RegisteredPipe {
  pub name: String,
  pub level: LogLevel,
  pub path: std::path::PathBuf,
}

/// What to do with the child's stdout.
pub enum StdoutMode {
  /// Forward to the sink as `DEBUG:stdout` lines.
  Log,
  /// Collect into memory, for `VAR=$(...)` command substitution.
  Capture,
  /// Send straight to a file (`cmd>file` redirection).
  File(std::fs::File),
}

/// Result of a multiplexed command run.
#[derive(Debug)]
pub struct CommandOutcome {
  pub status: ExitStatus,
  /// Raw stdout bytes as text, present only in `StdoutMode::Capture`.
  pub captured: Option<String>,
}

/// Reassembles complete lines from a chunked byte stream.
pub(crate) struct LineBuffer {
  pending: Vec<u8>,
}

impl LineBuffer {
  pub(crate) fn new() -> Self {
    Self { pending: Vec::new() }
  }

  /// Absorb a chunk and return every line it completes, without trailing
  /// newlines. Bytes after the last newline stay buffered.
  pub(crate) fn extend(&mut self, bytes: &[u8]) -> Vec<String> {
    let scan_from = self.pending.len();
    self.pending.extend_from_slice(bytes);
    let mut lines = Vec::new();
    let mut start = 0;
    let mut pos = scan_from;
    while let Some(offset) = self.pending[pos..].iter().position(|&b| b == b'\n') {
      let end = pos + offset;
      lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
      start = end + 1;
      pos = end + 1;
    }
    if start > 0 {
      self.pending.drain(..start);
    }
    lines
  }

  /// Return the trailing unterminated line, if any.
  pub(crate) fn flush(&mut self) -> Option<String> {
    if self.pending.is_empty() {
      return None;
    }
    let line = String::from_utf8_lossy(&self.pending).into_owned();
    self.pending.clear();
    Some(line)
  }
}

/// Run a fully-configured command, multiplexing its output channels into
/// `sink` until the process exits and all channels are drained.
///
/// Spawn errors (including command-not-found) surface as the `io::Error`
/// from `spawn`; a non-zero exit is reported through `CommandOutcome`, not as
/// an error.
pub async fn run_logged(
  mut command: Command,
  stdout: StdoutMode,
  pipes: &[RegisteredPipe],
  sink: Arc<dyn LogSink>,
  pipe_buf: usize,
) -> io::Result<CommandOutcome> {
  command.stdin(std::process::Stdio::null());
  command.stderr(std::process::Stdio::piped());
  let capture = matches!(stdout, StdoutMode::Capture);
  match stdout {
    StdoutMode::Log | StdoutMode::Capture => {
      command.stdout(std::process::Stdio::piped());
    }
    StdoutMode::File(file) => {
      command.stdout(std::process::Stdio::from(file));
    }
  }

  let mut child = command.spawn()?;

  let (tx, mut rx) = mpsc::channel::<LogRecord>(256);
  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  let consumer = {
    let sink = sink.clone();
    tokio::spawn(async move {
      while let Some(record) = rx.recv().await {
        sink.log(record);
      }
    })
  };

  let mut readers: Vec<JoinHandle<()>> = Vec::new();

  let stderr = child.stderr.take().expect("stderr was piped");
  readers.push(spawn_stream_reader(stderr, "stderr", tx.clone(), pipe_buf));

  let mut capture_task: Option<JoinHandle<io::Result<Vec<u8>>>> = None;
  if let Some(out) = child.stdout.take() {
    if capture {
      capture_task = Some(tokio::spawn(async move {
        let mut out = out;
        let mut bytes = Vec::new();
        out.read_to_end(&mut bytes).await?;
        Ok(bytes)
      }));
    } else {
      readers.push(spawn_stream_reader(out, "stdout", tx.clone(), pipe_buf));
    }
  }

  for registered in pipes {
    readers.push(spawn_fifo_reader(registered.clone(), tx.clone(), shutdown_rx.clone(), pipe_buf));
  }
  drop(tx);

  let status = child.wait().await;
  let _ = shutdown_tx.send(true);
  for reader in readers {
    let _ = reader.await;
  }
  // all senders are gone now, so the consumer drains and ends
  let _ = consumer.await;

  let captured = match capture_task {
    Some(task) => match task.await {
      Ok(Ok(bytes)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
      Ok(Err(e)) => return Err(e),
      Err(e) => return Err(io::Error::other(e)),
    },
    None => None,
  };

  Ok(CommandOutcome { status: status?, captured })
}

fn spawn_stream_reader<R>(
  mut stream: R,
  name: &'static str,
  tx: mpsc::Sender<LogRecord>,
  pipe_buf: usize,
) -> JoinHandle<()>
where
  R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let mut buf = vec![0u8; pipe_buf];
    let mut lines = LineBuffer::new();
    loop {
      match stream.read(&mut buf).await {
        Ok(0) => break,
        Ok(n) => {
          for line in lines.extend(&buf[..n]) {
            let record = LogRecord { level: LogLevel::Debug, name: name.to_string(), line };
            if tx.send(record).await.is_err() {
              return;
            }
          }
        }
        Err(e) => {
          warn!(stream = name, error = %e, "stream read failed");
          break;
        }
      }
    }
    if let Some(line) = lines.flush() {
      let record = LogRecord { level: LogLevel::Debug, name: name.to_string(), line };
      let _ = tx.send(record).await;
    }
  })
}

fn spawn_fifo_reader(
  registered: RegisteredPipe,
  tx: mpsc::Sender<LogRecord>,
  mut shutdown: watch::Receiver<bool>,
  pipe_buf: usize,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut buf = vec![0u8; pipe_buf];
    let mut lines = LineBuffer::new();
    let mut reader = match pipe::OpenOptions::new().open_receiver(&registered.path) {
      Ok(reader) => reader,
      Err(e) => {
        warn!(pipe = %registered.name, error = %e, "failed to open log pipe");
        return;
      }
    };
    loop {
      match reader.read(&mut buf).await {
        Ok(0) => {
          // EOF means every current writer closed. Once the command is done
          // that ends the channel; otherwise wait for the next writer. The
          // replacement receiver is opened before the old one is dropped, so
          // bytes a new writer queues in the kernel buffer during the
          // turnover are not lost.
          if *shutdown.borrow() {
            break;
          }
          tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
          }
          match pipe::OpenOptions::new().open_receiver(&registered.path) {
            Ok(fresh) => reader = fresh,
            Err(e) => {
              warn!(pipe = %registered.name, error = %e, "failed to reopen log pipe");
              break;
            }
          }
        }
        Ok(n) => {
          for line in lines.extend(&buf[..n]) {
            let record = LogRecord {
              level: registered.level,
              name: registered.name.clone(),
              line,
            };
            if tx.send(record).await.is_err() {
              return;
            }
          }
        }
        Err(e) => {
          warn!(pipe = %registered.name, error = %e, "log pipe read failed");
          break;
        }
      }
    }
    if let Some(line) = lines.flush() {
      let record = LogRecord { level: registered.level, name: registered.name.clone(), line };
      let _ = tx.send(record).await;
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::logsink::MemorySink;

  // -- LineBuffer --

  #[test]
  fn lines_split_across_chunks() {
    let mut lb = LineBuffer::new();
    assert_eq!(lb.extend(b"hel"), Vec::<String>::new());
    assert_eq!(lb.extend(b"lo\nwor"), vec!["hello"]);
    assert_eq!(lb.extend(b"ld\n"), vec!["world"]);
    assert_eq!(lb.flush(), None);
  }

  #[test]
  fn multiple_lines_in_one_chunk() {
    let mut lb = LineBuffer::new();
    assert_eq!(lb.extend(b"a\nb\nc"), vec!["a", "b"]);
    assert_eq!(lb.flush(), Some("c".to_string()));
    assert_eq!(lb.flush(), None);
  }

  #[test]
  fn line_longer_than_any_chunk() {
    let mut lb = LineBuffer::new();
    let payload = "x".repeat(1000);
    for chunk in payload.as_bytes().chunks(50) {
      assert!(lb.extend(chunk).is_empty());
    }
    assert_eq!(lb.extend(b"\n"), vec![payload]);
  }

  #[test]
  fn empty_lines_are_preserved() {
    let mut lb = LineBuffer::new();
    assert_eq!(lb.extend(b"\n\na\n"), vec!["", "", "a"]);
  }

  // -- run_logged --

  fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .unwrap()
      .block_on(future)
  }

  fn sh(script: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", script]);
    cmd
  }

  #[test]
  fn stdout_and_stderr_are_tagged() {
    let sink = Arc::new(MemorySink::new());
    let outcome = block_on(run_logged(
      sh("echo out; echo err >&2"),
      StdoutMode::Log,
      &[],
      sink.clone(),
      DEFAULT_PIPE_BUF,
    ))
    .unwrap();
    assert!(outcome.status.success());
    assert!(outcome.captured.is_none());
    let lines = sink.lines();
    assert!(lines.contains(&"DEBUG:stdout:out".to_string()), "{lines:?}");
    assert!(lines.contains(&"DEBUG:stderr:err".to_string()), "{lines:?}");
  }

  #[test]
  fn capture_mode_collects_stdout() {
    let sink = Arc::new(MemorySink::new());
    let outcome = block_on(run_logged(
      sh("printf 'captured'; echo noise >&2"),
      StdoutMode::Capture,
      &[],
      sink.clone(),
      DEFAULT_PIPE_BUF,
    ))
    .unwrap();
    assert_eq!(outcome.captured.as_deref(), Some("captured"));
    // stderr still goes to the sink
    assert!(sink.lines().contains(&"DEBUG:stderr:noise".to_string()));
  }

  #[test]
  fn nonzero_exit_is_reported_in_status() {
    let sink = Arc::new(MemorySink::new());
    let outcome =
      block_on(run_logged(sh("exit 3"), StdoutMode::Log, &[], sink, DEFAULT_PIPE_BUF)).unwrap();
    assert_eq!(outcome.status.code(), Some(3));
  }

  #[test]
  fn missing_command_is_a_spawn_error() {
    let sink = Arc::new(MemorySink::new());
    let err = block_on(run_logged(
      Command::new("/no/such/binary"),
      StdoutMode::Log,
      &[],
      sink,
      DEFAULT_PIPE_BUF,
    ))
    .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
  }

  #[cfg(unix)]
  #[test]
  fn fifo_lines_carry_registered_level_and_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logpipe-mylog-WARNING");
    nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
      .unwrap();
    let registered = RegisteredPipe {
      name: "mylog".to_string(),
      level: LogLevel::Warning,
      path: path.clone(),
    };
    let sink = Arc::new(MemorySink::new());
    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", "echo hello > \"$1\"", "sh", path.to_str().unwrap()]);
    let outcome =
      block_on(run_logged(cmd, StdoutMode::Log, &[registered], sink.clone(), DEFAULT_PIPE_BUF))
        .unwrap();
    assert!(outcome.status.success());
    assert!(sink.lines().contains(&"WARNING:mylog:hello".to_string()), "{:?}", sink.lines());
  }
}
