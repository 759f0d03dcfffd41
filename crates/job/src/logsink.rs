//! Leveled log records and the sinks they are delivered to.
//!
//! Everything a job prints — subprocess stdout/stderr and application-level
//! messages written to log pipes — is normalized into `LogRecord`s and handed
//! to a single `LogSink`. The store points the sink at the build log file;
//! tests capture records in memory.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;

/// Severity of a log record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
  Debug,
  Info,
  Warning,
  Error,
  Critical,
}

impl LogLevel {
  pub fn as_str(self) -> &'static str {
    match self {
      LogLevel::Debug => "DEBUG",
      LogLevel::Info => "INFO",
      LogLevel::Warning => "WARNING",
      LogLevel::Error => "ERROR",
      LogLevel::Critical => "CRITICAL",
    }
  }
}

impl fmt::Display for LogLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown log level: {0}")]
pub struct UnknownLevel(pub String);

impl FromStr for LogLevel {
  type Err = UnknownLevel;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "DEBUG" => Ok(LogLevel::Debug),
      "INFO" => Ok(LogLevel::Info),
      "WARNING" => Ok(LogLevel::Warning),
      "ERROR" => Ok(LogLevel::Error),
      "CRITICAL" => Ok(LogLevel::Critical),
      other => Err(UnknownLevel(other.to_string())),
    }
  }
}

/// One line of job output, tagged with its severity and the stream it came
/// from (`stdout`, `stderr`, or a log pipe name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
  pub level: LogLevel,
  pub name: String,
  pub line: String,
}

impl LogRecord {
  /// The `LEVEL:name:line` form used in build logs.
  pub fn formatted(&self) -> String {
    format!("{}:{}:{}", self.level, self.name, self.line)
  }
}

/// Destination for job log records.
///
/// `log` is called from a single consumer task, but the sink is shared across
/// tasks and must be `Sync`.
pub trait LogSink: Send + Sync {
  fn log(&self, record: LogRecord);
}

/// Sink that collects records in memory, for tests and captured runs.
#[derive(Default)]
pub struct MemorySink {
  records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn records(&self) -> Vec<LogRecord> {
    self.records.lock().unwrap().clone()
  }

  /// All records in the `LEVEL:name:line` form.
  pub fn lines(&self) -> Vec<String> {
    self.records().iter().map(LogRecord::formatted).collect()
  }
}

impl LogSink for MemorySink {
  fn log(&self, record: LogRecord) {
    self.records.lock().unwrap().push(record);
  }
}

/// Sink that forwards records to the `tracing` subscriber.
pub struct TracingSink;

impl LogSink for TracingSink {
  fn log(&self, record: LogRecord) {
    match record.level {
      LogLevel::Debug => tracing::debug!(stream = %record.name, "{}", record.line),
      LogLevel::Info => tracing::info!(stream = %record.name, "{}", record.line),
      LogLevel::Warning => tracing::warn!(stream = %record.name, "{}", record.line),
      LogLevel::Error | LogLevel::Critical => {
        tracing::error!(stream = %record.name, "{}", record.line)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn levels_round_trip_and_order() {
    for level in [
      LogLevel::Debug,
      LogLevel::Info,
      LogLevel::Warning,
      LogLevel::Error,
      LogLevel::Critical,
    ] {
      assert_eq!(level.as_str().parse::<LogLevel>().unwrap(), level);
    }
    assert!(LogLevel::Debug < LogLevel::Warning);
    assert!(LogLevel::Error < LogLevel::Critical);
    assert!("warning".parse::<LogLevel>().is_err());
  }

  #[test]
  fn formatted_record() {
    let record = LogRecord {
      level: LogLevel::Warning,
      name: "mylog".into(),
      line: "hello".into(),
    };
    assert_eq!(record.formatted(), "WARNING:mylog:hello");
  }

  #[test]
  fn memory_sink_keeps_order() {
    let sink = MemorySink::new();
    sink.log(LogRecord { level: LogLevel::Debug, name: "stdout".into(), line: "a".into() });
    sink.log(LogRecord { level: LogLevel::Debug, name: "stderr".into(), line: "b".into() });
    assert_eq!(sink.lines(), vec!["DEBUG:stdout:a", "DEBUG:stderr:b"]);
  }
}
