//! Device error types.

use thiserror::Error;

use crate::script::ProcessError;

/// What an event listener may fail with.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when talking to a device.
#[derive(Debug, Error)]
pub enum Error {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),

  #[error("Unable to parse update: {reason}")]
  Parse { line: String, reason: String },

  #[error("{}", exception_text(.message, .stacktrace.as_deref()))]
  Device {
    message: String,
    stacktrace: Option<String>,
  },

  /// I/O failure reported while the subprocess runs, shown unchanged.
  #[error("{0}")]
  Io(String),

  #[error("Got stderr output: {0}")]
  Stderr(String),

  #[error("{0}")]
  Listener(ListenerError),

  #[error("Unexpected response: {0}")]
  UnexpectedResponse(String),

  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),
}

fn exception_text(message: &str, stacktrace: Option<&str>) -> String {
  match stacktrace {
    Some(trace) if !trace.is_empty() => format!("{}\n{}", message, trace),
    _ => message.to_string(),
  }
}

pub type Result<T> = std::result::Result<T, Error>;
