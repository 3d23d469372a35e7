//! atvscript detection and subprocess spawning.
//!
//! A spawned process is exposed as a [`ProcessHandle`] (stdin + kill) and a
//! stream of [`ProcessEvent`]s. The stream always ends with
//! [`ProcessEvent::Exit`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("{0} executable not found")]
  NotFound(String),
  #[error("Failed to spawn process: {0}")]
  SpawnFailed(#[from] std::io::Error),
  #[error("Process I/O error: {0}")]
  Io(String),
  #[error("Process exited with code {code:?}: {stderr}")]
  Failed { code: Option<i32>, stderr: String },
  #[error("Invalid process output: {0}")]
  InvalidOutput(String),
  #[error("Process already exited")]
  Exited,
}

/// Something the subprocess did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
  /// Raw stdout chunk, not aligned to lines.
  Stdout(Vec<u8>),
  /// One stderr line without its terminator.
  Stderr(String),
  /// Spawn or I/O failure while the process is running.
  Error(String),
  /// Exit code, `None` when terminated by a signal. Always the last event.
  Exit(Option<i32>),
}

/// Control side of a running subprocess.
pub trait ProcessHandle: Send + Sync {
  /// Queue bytes for the process's standard input.
  fn write_stdin(&self, data: &[u8]) -> Result<(), ProcessError>;

  /// Forcibly terminate the process. Idempotent.
  fn kill(&self);

  fn pid(&self) -> Option<u32>;
}

/// A freshly spawned subprocess.
pub struct SpawnedProcess {
  pub handle: Arc<dyn ProcessHandle>,
  pub events: Receiver<ProcessEvent>,
}

/// Spawns subprocesses. Implemented by [`TokioProcessRunner`] and by the fake
/// runner used in tests.
pub trait ProcessRunner: Send + Sync {
  fn spawn(&self, program: &str, args: &[String]) -> Result<SpawnedProcess, ProcessError>;
}

/// Find an executable in PATH or in common install locations.
pub fn find_executable(name: &str) -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which(name) {
    return Some(path);
  }

  #[cfg(target_os = "macos")]
  {
    let common_dirs = ["/usr/local/bin", "/opt/homebrew/bin"];
    for dir in common_dirs {
      let p = PathBuf::from(dir).join(name);
      if p.exists() {
        return Some(p);
      }
    }
  }

  #[cfg(target_os = "linux")]
  {
    let common_dirs = ["/usr/bin", "/usr/local/bin"];
    for dir in common_dirs {
      let p = PathBuf::from(dir).join(name);
      if p.exists() {
        return Some(p);
      }
    }
  }

  None
}

/// Program to run: the configured path, else the detected one, else the bare
/// name (left to the OS to resolve at spawn time).
pub fn resolve_program(custom: Option<&str>, name: &str) -> String {
  if let Some(path) = custom.filter(|p| !p.trim().is_empty()) {
    return path.to_string();
  }
  find_executable(name)
    .map(|p| p.to_string_lossy().into_owned())
    .unwrap_or_else(|| name.to_string())
}

/// Spawns real processes with piped stdio. Must be used from within a Tokio
/// runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
  pub fn new() -> Self {
    Self
  }
}

impl ProcessRunner for TokioProcessRunner {
  fn spawn(&self, program: &str, args: &[String]) -> Result<SpawnedProcess, ProcessError> {
    log::debug!("Spawning {} {:?}", program, args);

    let mut child = Command::new(program)
      .args(args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ProcessError::NotFound(program.to_string()),
        _ => ProcessError::SpawnFailed(e),
      })?;

    let pid = child.id();
    let (event_tx, event_rx) = async_channel::unbounded();
    let (write_tx, write_rx) = async_channel::unbounded::<Vec<u8>>();
    let kill_token = CancellationToken::new();

    let stdout_task = child
      .stdout
      .take()
      .map(|stdout| tokio::spawn(stdout_loop(stdout, event_tx.clone())));
    let stderr_task = child
      .stderr
      .take()
      .map(|stderr| tokio::spawn(stderr_loop(stderr, event_tx.clone())));
    if let Some(stdin) = child.stdin.take() {
      tokio::spawn(writer_loop(stdin, write_rx, event_tx.clone()));
    }

    tokio::spawn(wait_loop(
      child,
      kill_token.clone(),
      [stdout_task, stderr_task],
      event_tx,
    ));

    Ok(SpawnedProcess {
      handle: Arc::new(TokioProcessHandle {
        write_tx,
        kill_token,
        pid,
      }),
      events: event_rx,
    })
  }
}

struct TokioProcessHandle {
  write_tx: Sender<Vec<u8>>,
  kill_token: CancellationToken,
  pid: Option<u32>,
}

impl ProcessHandle for TokioProcessHandle {
  fn write_stdin(&self, data: &[u8]) -> Result<(), ProcessError> {
    self
      .write_tx
      .try_send(data.to_vec())
      .map_err(|_| ProcessError::Exited)
  }

  fn kill(&self) {
    self.kill_token.cancel();
  }

  fn pid(&self) -> Option<u32> {
    self.pid
  }
}

async fn stdout_loop<R: AsyncRead + Unpin>(mut reader: R, event_tx: Sender<ProcessEvent>) {
  let mut buf = vec![0u8; 8192];
  loop {
    match reader.read(&mut buf).await {
      Ok(0) => break,
      Ok(n) => {
        if event_tx.send(ProcessEvent::Stdout(buf[..n].to_vec())).await.is_err() {
          break;
        }
      }
      Err(e) => {
        log::error!("stdout read error: {}", e);
        let _ = event_tx.send(ProcessEvent::Error(e.to_string())).await;
        break;
      }
    }
  }
}

async fn stderr_loop<R: AsyncRead + Unpin>(reader: R, event_tx: Sender<ProcessEvent>) {
  let mut lines = BufReader::new(reader).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => {
        if event_tx.send(ProcessEvent::Stderr(line)).await.is_err() {
          break;
        }
      }
      Ok(None) => break,
      Err(e) => {
        log::error!("stderr read error: {}", e);
        let _ = event_tx.send(ProcessEvent::Error(e.to_string())).await;
        break;
      }
    }
  }
}

async fn writer_loop<W: AsyncWrite + Unpin>(
  mut writer: W,
  write_rx: Receiver<Vec<u8>>,
  event_tx: Sender<ProcessEvent>,
) {
  // Ends when the handle (the only sender) is dropped
  while let Ok(data) = write_rx.recv().await {
    let result = async {
      writer.write_all(&data).await?;
      writer.flush().await
    }
    .await;
    if let Err(e) = result {
      // A closed pipe after exit is expected
      if e.kind() != std::io::ErrorKind::BrokenPipe {
        let _ = event_tx.send(ProcessEvent::Error(e.to_string())).await;
      }
      break;
    }
  }
}

async fn wait_loop(
  mut child: Child,
  kill_token: CancellationToken,
  readers: [Option<JoinHandle<()>>; 2],
  event_tx: Sender<ProcessEvent>,
) {
  let exited = tokio::select! {
    status = child.wait() => Some(status),
    _ = kill_token.cancelled() => None,
  };
  let status = match exited {
    Some(status) => status,
    None => {
      log::debug!("Killing process (pid: {:?})", child.id());
      if let Err(e) = child.start_kill() {
        log::warn!("kill() failed: {}", e);
      }
      child.wait().await
    }
  };

  // Deliver remaining output before the exit notice
  for reader in readers.into_iter().flatten() {
    let _ = reader.await;
  }

  let code = match status {
    Ok(status) => {
      log::debug!("Process exited with: {}", status);
      status.code()
    }
    Err(e) => {
      log::error!("wait() failed: {}", e);
      let _ = event_tx.send(ProcessEvent::Error(e.to_string())).await;
      None
    }
  };
  let _ = event_tx.send(ProcessEvent::Exit(code)).await;
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  async fn collect(events: Receiver<ProcessEvent>) -> Vec<ProcessEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.recv().await {
      let last = matches!(event, ProcessEvent::Exit(_));
      out.push(event);
      if last {
        break;
      }
    }
    out
  }

  #[test]
  fn test_resolve_program_prefers_custom_path() {
    assert_eq!(resolve_program(Some("/opt/atvscript"), "atvscript"), "/opt/atvscript");
    assert!(!resolve_program(Some("  "), "atvscript").is_empty());
  }

  #[tokio::test]
  async fn test_spawn_streams_stdout_and_exit_code() {
    let spawned = TokioProcessRunner::new()
      .spawn("sh", &["-c".to_string(), "echo hello; echo oops >&2; exit 3".to_string()])
      .unwrap();
    let events = collect(spawned.events).await;

    let stdout: Vec<u8> = events
      .iter()
      .filter_map(|e| match e {
        ProcessEvent::Stdout(chunk) => Some(chunk.clone()),
        _ => None,
      })
      .flatten()
      .collect();
    assert_eq!(String::from_utf8(stdout).unwrap(), "hello\n");
    assert!(events.contains(&ProcessEvent::Stderr("oops".to_string())));
    assert_eq!(events.last(), Some(&ProcessEvent::Exit(Some(3))));
  }

  #[tokio::test]
  async fn test_stdin_newline_ends_read_loop() {
    let spawned = TokioProcessRunner::new()
      .spawn("sh", &["-c".to_string(), "read line; echo done".to_string()])
      .unwrap();
    spawned.handle.write_stdin(b"\n").unwrap();
    let events = collect(spawned.events).await;
    assert_eq!(events.last(), Some(&ProcessEvent::Exit(Some(0))));
  }

  #[tokio::test]
  async fn test_kill_terminates_process() {
    let spawned = TokioProcessRunner::new()
      .spawn("sleep", &["30".to_string()])
      .unwrap();
    spawned.handle.kill();
    let events = collect(spawned.events).await;
    assert_eq!(events.last(), Some(&ProcessEvent::Exit(None)));
  }

  #[test]
  fn test_spawn_missing_program_fails() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let result = rt.block_on(async {
      TokioProcessRunner::new()
        .spawn("definitely-not-an-atvscript-binary", &[])
        .map(|_| ())
    });
    assert!(matches!(result, Err(ProcessError::NotFound(_))));
  }
}
