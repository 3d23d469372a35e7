//! Deterministic stand-in for atvscript.
//!
//! Nothing is executed: the test decides what each "process" writes and when
//! it exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_channel::Sender;
use parking_lot::Mutex;

use super::process::{ProcessError, ProcessEvent, ProcessHandle, ProcessRunner, SpawnedProcess};

static NEXT_PID: AtomicU32 = AtomicU32::new(10_000);

/// Program and arguments of one spawn call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSpawn {
  pub program: String,
  pub args: Vec<String>,
}

/// Output played back immediately by the next spawned process.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
  events: Vec<ProcessEvent>,
}

impl FakeScript {
  pub fn stdout(data: &str) -> Self {
    Self::default().then_stdout(data)
  }

  pub fn then_stdout(mut self, data: &str) -> Self {
    self.events.push(ProcessEvent::Stdout(data.as_bytes().to_vec()));
    self
  }

  pub fn stderr_line(mut self, line: &str) -> Self {
    self.events.push(ProcessEvent::Stderr(line.to_string()));
    self
  }

  pub fn error(mut self, message: &str) -> Self {
    self.events.push(ProcessEvent::Error(message.to_string()));
    self
  }

  pub fn exit(mut self, code: i32) -> Self {
    self.events.push(ProcessEvent::Exit(Some(code)));
    self
  }
}

struct FakeProcessState {
  event_tx: Sender<ProcessEvent>,
  stdin: Mutex<Vec<u8>>,
  killed: AtomicBool,
  exited: AtomicBool,
  exit_on_newline: bool,
  pid: u32,
}

/// Test-side view of a spawned fake process.
#[derive(Clone)]
pub struct FakeProcess {
  state: Arc<FakeProcessState>,
}

impl FakeProcess {
  fn emit(&self, event: ProcessEvent) {
    if self.state.exited.load(Ordering::SeqCst) {
      return;
    }
    if matches!(event, ProcessEvent::Exit(_)) {
      self.state.exited.store(true, Ordering::SeqCst);
    }
    let _ = self.state.event_tx.try_send(event);
  }

  /// Write raw stdout data (no newline added).
  pub fn stdout(&self, data: &str) {
    self.emit(ProcessEvent::Stdout(data.as_bytes().to_vec()));
  }

  /// Write one stdout line.
  pub fn stdout_line(&self, line: &str) {
    self.stdout(&format!("{}\n", line));
  }

  pub fn stderr(&self, line: &str) {
    self.emit(ProcessEvent::Stderr(line.to_string()));
  }

  pub fn error(&self, message: &str) {
    self.emit(ProcessEvent::Error(message.to_string()));
  }

  /// Exit with `code`. Later output is discarded.
  pub fn exit(&self, code: Option<i32>) {
    self.emit(ProcessEvent::Exit(code));
  }

  /// Everything written to stdin so far.
  pub fn stdin(&self) -> Vec<u8> {
    self.state.stdin.lock().clone()
  }

  pub fn is_killed(&self) -> bool {
    self.state.killed.load(Ordering::SeqCst)
  }

  pub fn has_exited(&self) -> bool {
    self.state.exited.load(Ordering::SeqCst)
  }
}

impl ProcessHandle for FakeProcess {
  fn write_stdin(&self, data: &[u8]) -> Result<(), ProcessError> {
    if self.has_exited() {
      return Err(ProcessError::Exited);
    }
    self.state.stdin.lock().extend_from_slice(data);
    if self.state.exit_on_newline && data.contains(&b'\n') {
      self.exit(Some(0));
    }
    Ok(())
  }

  fn kill(&self) {
    self.state.killed.store(true, Ordering::SeqCst);
    self.exit(None);
  }

  fn pid(&self) -> Option<u32> {
    Some(self.state.pid)
  }
}

#[derive(Default)]
struct RunnerState {
  spawns: Vec<FakeSpawn>,
  processes: Vec<FakeProcess>,
  scripts: VecDeque<FakeScript>,
  spawn_errors: VecDeque<String>,
  ignore_stdin: bool,
}

/// Records spawns and hands out [`FakeProcess`]es. Clones share state.
#[derive(Clone, Default)]
pub struct FakeProcessRunner {
  state: Arc<Mutex<RunnerState>>,
}

impl FakeProcessRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Play `script` on the next spawn that has no earlier script queued.
  pub fn enqueue(&self, script: FakeScript) {
    self.state.lock().scripts.push_back(script);
  }

  /// Make the next spawn fail with `message`.
  pub fn fail_next_spawn(&self, message: &str) {
    self.state.lock().spawn_errors.push_back(message.to_string());
  }

  /// By default a process exits when it reads a newline on stdin, like
  /// atvscript does. Disable to simulate a process that has to be killed.
  pub fn set_ignore_stdin(&self, ignore: bool) {
    self.state.lock().ignore_stdin = ignore;
  }

  pub fn spawns(&self) -> Vec<FakeSpawn> {
    self.state.lock().spawns.clone()
  }

  pub fn spawn_count(&self) -> usize {
    self.state.lock().spawns.len()
  }

  pub fn processes(&self) -> Vec<FakeProcess> {
    self.state.lock().processes.clone()
  }

  pub fn last_process(&self) -> Option<FakeProcess> {
    self.state.lock().processes.last().cloned()
  }
}

impl ProcessRunner for FakeProcessRunner {
  fn spawn(&self, program: &str, args: &[String]) -> Result<SpawnedProcess, ProcessError> {
    let mut state = self.state.lock();
    state.spawns.push(FakeSpawn {
      program: program.to_string(),
      args: args.to_vec(),
    });

    if let Some(message) = state.spawn_errors.pop_front() {
      return Err(ProcessError::SpawnFailed(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        message,
      )));
    }

    let (event_tx, event_rx) = async_channel::unbounded();
    let process = FakeProcess {
      state: Arc::new(FakeProcessState {
        event_tx,
        stdin: Mutex::new(Vec::new()),
        killed: AtomicBool::new(false),
        exited: AtomicBool::new(false),
        exit_on_newline: !state.ignore_stdin,
        pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
      }),
    };

    if let Some(script) = state.scripts.pop_front() {
      for event in script.events {
        process.emit(event);
      }
    }

    state.processes.push(process.clone());
    Ok(SpawnedProcess {
      handle: Arc::new(process),
      events: event_rx,
    })
  }
}
