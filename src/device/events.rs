//! Push update subscription for one device.
//!
//! A long-running `atvscript push_updates` process runs exactly while at
//! least one listener is registered. Its output is parsed line by line,
//! diffed against the cached state and turned into `update:<key>` / `update`
//! events. Registration methods reconcile the process lifecycle after every
//! change.
//!
//! All state lives behind one mutex. Listeners are only ever called with the
//! lock released, so they may register or remove listeners themselves.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_channel::Receiver;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{Error, ListenerError};
use super::state::parse_line;
use super::types::{
  ChangeEvent, DeviceRef, Event, EventName, ListenerState, StateKey, StateSnapshot, StateValue,
};
use crate::config::{DeviceOptions, ListenerTimings};
use crate::script::{ProcessError, ProcessEvent, ProcessHandle, ProcessRunner, ScriptCommand, TraceId};

/// Callback registered for an [`EventName`].
pub type Listener = Arc<dyn Fn(&Event) -> Result<(), ListenerError> + Send + Sync>;

/// Token returned by registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Keys a partial push record is restricted to, by priority.
const OVERRIDE_KEYS: [StateKey; 4] = [
  StateKey::PowerState,
  StateKey::FocusState,
  StateKey::OutputDevices,
  StateKey::Volume,
];

struct Registration {
  id: ListenerId,
  name: EventName,
  callback: Listener,
  once: bool,
}

/// The running push update process.
struct ActiveProcess {
  generation: u64,
  handle: Arc<dyn ProcessHandle>,
  started_at: Instant,
  /// Cancelled once the exit has been observed.
  exited: CancellationToken,
  trace: TraceId,
}

struct Inner {
  state: StateSnapshot,
  listener_state: ListenerState,
  listeners: Vec<Registration>,
  next_listener_id: u64,
  process: Option<ActiveProcess>,
  restart: Option<CancellationToken>,
  generation: u64,
}

struct Shared {
  options: Arc<DeviceOptions>,
  device: DeviceRef,
  timings: ListenerTimings,
  runner: Arc<dyn ProcessRunner>,
  inner: Mutex<Inner>,
}

/// Event emitter whose listener count drives the push update process.
#[derive(Clone)]
pub struct DeviceEvents {
  shared: Arc<Shared>,
}

enum Transition {
  Start,
  Stop,
}

impl DeviceEvents {
  pub fn new(
    options: Arc<DeviceOptions>,
    timings: ListenerTimings,
    runner: Arc<dyn ProcessRunner>,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        device: DeviceRef::new(options.clone()),
        options,
        timings,
        runner,
        inner: Mutex::new(Inner {
          state: StateSnapshot::default(),
          listener_state: ListenerState::Stopped,
          listeners: Vec::new(),
          next_listener_id: 1,
          process: None,
          restart: None,
          generation: 0,
        }),
      }),
    }
  }

  /// Register `listener` for `name`, after the existing ones.
  pub fn add_listener<F>(&self, name: EventName, listener: F) -> ListenerId
  where
    F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
  {
    let id = self.shared.register(name, Arc::new(listener), false, false);
    self.shared.reconcile();
    id
  }

  /// Register `listener` for `name`, before the existing ones.
  pub fn prepend_listener<F>(&self, name: EventName, listener: F) -> ListenerId
  where
    F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
  {
    let id = self.shared.register(name, Arc::new(listener), false, true);
    self.shared.reconcile();
    id
  }

  /// Register `listener` for the next `name` event only.
  ///
  /// After it ran, the lifecycle is reconciled again, so a subscription kept
  /// alive only by this listener stops after delivering.
  pub fn once<F>(&self, name: EventName, listener: F) -> ListenerId
  where
    F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
  {
    let id = self.shared.register(name, Arc::new(listener), true, false);
    self.shared.reconcile();
    id
  }

  /// Returns false if `id` was not registered.
  pub fn remove_listener(&self, id: ListenerId) -> bool {
    let removed = {
      let mut inner = self.shared.inner.lock();
      let before = inner.listeners.len();
      inner.listeners.retain(|r| r.id != id);
      inner.listeners.len() != before
    };
    self.shared.reconcile();
    removed
  }

  /// Remove the listeners of `name`, or all listeners when `None`.
  pub fn remove_all_listeners(&self, name: Option<EventName>) {
    {
      let mut inner = self.shared.inner.lock();
      match name {
        Some(name) => inner.listeners.retain(|r| r.name != name),
        None => inner.listeners.clear(),
      }
    }
    self.shared.reconcile();
  }

  /// Listeners of `name`, or of every event when `None`.
  pub fn listener_count(&self, name: Option<EventName>) -> usize {
    let inner = self.shared.inner.lock();
    match name {
      Some(name) => inner.listeners.iter().filter(|r| r.name == name).count(),
      None => inner.listeners.len(),
    }
  }

  pub fn listener_state(&self) -> ListenerState {
    self.shared.inner.lock().listener_state
  }

  /// Copy of the cached state.
  pub fn state(&self) -> StateSnapshot {
    self.shared.inner.lock().state.clone()
  }

  /// Reset every cached attribute to unknown without emitting events.
  pub fn clear_state(&self) {
    self.shared.inner.lock().state = StateSnapshot::default();
  }

  /// Diff `new_state` against the cached state, update the cache and emit
  /// `update:<key>` and `update` for every changed attribute.
  pub fn apply_state_and_emit_events(&self, new_state: &StateSnapshot) {
    self.shared.apply_state_and_emit_events(new_state);
  }

  /// Emit `event` under `name` to the registered listeners.
  pub fn emit(&self, name: EventName, event: Event) {
    self.shared.emit(name, event);
  }
}

impl Shared {
  fn register(&self, name: EventName, callback: Listener, once: bool, prepend: bool) -> ListenerId {
    let mut inner = self.inner.lock();
    let id = ListenerId(inner.next_listener_id);
    inner.next_listener_id += 1;
    let registration = Registration {
      id,
      name,
      callback,
      once,
    };
    if prepend {
      inner.listeners.insert(0, registration);
    } else {
      inner.listeners.push(registration);
    }
    id
  }

  /// Start or stop the process so that it runs iff listeners exist.
  fn reconcile(self: &Arc<Self>) {
    let mut errors = Vec::new();
    {
      let mut inner = self.inner.lock();
      let count = inner.listeners.len();
      let current = inner.listener_state;
      let transition = match current {
        ListenerState::Stopped if count == 0 => {
          if let Some(restart) = inner.restart.take() {
            log::debug!("[{}] No listeners left, cancel pending restart", self.device);
            restart.cancel();
          }
          None
        }
        ListenerState::Stopped => Some(Transition::Start),
        ListenerState::Starting | ListenerState::Started if count == 0 => Some(Transition::Stop),
        _ => None,
      };

      match transition {
        Some(Transition::Start) => self.start_locked(&mut inner, &mut errors),
        Some(Transition::Stop) => self.stop_locked(&mut inner),
        None => {}
      }
    }

    for error in errors {
      self.emit_error(error);
    }
  }

  fn start_locked(self: &Arc<Self>, inner: &mut Inner, errors: &mut Vec<Error>) {
    let Ok(runtime) = Handle::try_current() else {
      log::error!("[{}] Cannot start push updates outside of a Tokio runtime", self.device);
      errors.push(Error::Process(ProcessError::Io(
        "push updates need a Tokio runtime".to_string(),
      )));
      return;
    };

    if let Some(restart) = inner.restart.take() {
      restart.cancel();
    }

    let trace = TraceId::new();
    let command = ScriptCommand::push_updates(&self.options);
    log::info!("[{}] Starting push updates for {}", trace, self.device);

    match self.runner.spawn(&command.program, &command.args) {
      Ok(spawned) => {
        log::debug!("[{}] push updates running (pid: {:?})", trace, spawned.handle.pid());
        inner.generation += 1;
        let generation = inner.generation;
        inner.process = Some(ActiveProcess {
          generation,
          handle: spawned.handle,
          started_at: Instant::now(),
          exited: CancellationToken::new(),
          trace,
        });
        inner.listener_state = ListenerState::Starting;
        runtime.spawn(pump(Arc::downgrade(self), generation, spawned.events, trace));
      }
      Err(e) => {
        log::error!("[{}] Failed to spawn push updates: {}", trace, e);
        errors.push(Error::Process(e));
        self.schedule_restart_locked(inner, &runtime);
      }
    }
  }

  /// Ask the process to exit, kill it if it is still around after the grace
  /// period.
  fn stop_locked(self: &Arc<Self>, inner: &mut Inner) {
    if !matches!(
      inner.listener_state,
      ListenerState::Starting | ListenerState::Started
    ) {
      return;
    }
    inner.listener_state = ListenerState::Stopping;

    let Some(process) = inner.process.as_ref() else {
      inner.listener_state = ListenerState::Stopped;
      return;
    };
    log::info!("[{}] Stopping push updates", process.trace);

    if let Err(e) = process.handle.write_stdin(b"\n") {
      log::debug!("[{}] Unable to send stop signal: {}", process.trace, e);
    }

    let generation = process.generation;
    let exited = process.exited.clone();
    let grace = self.timings.stop_grace();
    let weak = Arc::downgrade(self);

    match Handle::try_current() {
      Ok(runtime) => {
        runtime.spawn(async move {
          let _ = tokio::time::timeout(grace, exited.cancelled()).await;
          if let Some(shared) = weak.upgrade() {
            shared.finish_stop(generation);
          }
        });
      }
      Err(_) => {
        process.handle.kill();
        inner.process = None;
        inner.listener_state = ListenerState::Stopped;
      }
    }
  }

  fn finish_stop(self: &Arc<Self>, generation: u64) {
    let killed = {
      let mut inner = self.inner.lock();
      let still_running = inner.listener_state == ListenerState::Stopping
        && inner.process.as_ref().map(|p| p.generation) == Some(generation);
      if still_running {
        if let Some(process) = inner.process.take() {
          log::info!(
            "[{}] Push updates did not exit in time, killing it",
            process.trace
          );
          process.handle.kill();
          process.exited.cancel();
        }
        inner.listener_state = ListenerState::Stopped;
      }
      still_running
    };

    if killed {
      self.emit(EventName::Close, Event::Close);
      self.reconcile();
    }
  }

  fn schedule_restart_locked(self: &Arc<Self>, inner: &mut Inner, runtime: &Handle) {
    let token = CancellationToken::new();
    inner.restart = Some(token.clone());

    let delay = self.timings.restart_delay();
    log::info!("[{}] Restarting push updates in {:?}", self.device, delay);

    let weak = Arc::downgrade(self);
    runtime.spawn(async move {
      tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
      }
      let Some(shared) = weak.upgrade() else {
        return;
      };
      {
        let mut inner = shared.inner.lock();
        if token.is_cancelled() {
          return;
        }
        inner.restart = None;
      }
      shared.reconcile();
    });
  }

  fn is_current(&self, generation: u64) -> bool {
    self.inner.lock().process.as_ref().map(|p| p.generation) == Some(generation)
  }

  fn handle_line(self: &Arc<Self>, generation: u64, line: &str, trace: TraceId) {
    if line.trim().is_empty() || !self.is_current(generation) {
      return;
    }
    log::debug!("[{}] push update: {}", trace, line);

    match parse_line(line, trace) {
      Ok(snapshot) => {
        {
          let mut inner = self.inner.lock();
          if inner.listener_state == ListenerState::Starting {
            inner.listener_state = ListenerState::Started;
            log::info!("[{}] Push updates started", trace);
          }
        }
        self.apply_state_and_emit_events(&snapshot);
      }
      Err(e) => self.emit_error(e),
    }
  }

  fn handle_exit(self: &Arc<Self>, generation: u64, code: Option<i32>) {
    let (uptime, intentional) = {
      let mut inner = self.inner.lock();
      let process = match inner.process.take() {
        Some(p) if p.generation == generation => p,
        other => {
          inner.process = other;
          return;
        }
      };
      process.exited.cancel();
      log::info!("[{}] Push updates exited with code {:?}", process.trace, code);

      let intentional = inner.listener_state == ListenerState::Stopping;
      inner.listener_state = ListenerState::Stopped;
      (process.started_at.elapsed(), intentional)
    };

    self.emit(EventName::Close, Event::Close);
    self.after_exit(uptime, intentional);
  }

  /// Restart policy: crashes wait out a cool-down, long-lived or requested
  /// exits restart right away.
  fn after_exit(self: &Arc<Self>, uptime: Duration, intentional: bool) {
    let restart_now = {
      let mut inner = self.inner.lock();
      if inner.listener_state != ListenerState::Stopped
        || inner.listeners.is_empty()
        || inner.restart.is_some()
      {
        return;
      }
      if !intentional && uptime < self.timings.crash_threshold() {
        match Handle::try_current() {
          Ok(runtime) => self.schedule_restart_locked(&mut inner, &runtime),
          Err(_) => log::warn!("[{}] No runtime to schedule a restart", self.device),
        }
        false
      } else {
        true
      }
    };

    if restart_now {
      self.reconcile();
    }
  }

  fn apply_state_and_emit_events(self: &Arc<Self>, new_state: &StateSnapshot) {
    if new_state.is_unknown() {
      log::debug!("[{}] Skip update without known attributes", self.device);
      return;
    }

    let keys: Vec<StateKey> = match OVERRIDE_KEYS.iter().find(|key| new_state.has(**key)) {
      Some(key) => vec![*key],
      None => StateKey::ALL.to_vec(),
    };

    for key in keys {
      let change = {
        let mut inner = self.inner.lock();
        let old_value = inner.state.get(key);
        let new_value = new_state.get(key);
        if values_equal(&old_value, &new_value) {
          continue;
        }
        inner.state.copy_field(new_state, key);
        ChangeEvent {
          key,
          old_value,
          new_value,
          device: self.device.clone(),
        }
      };

      self.emit(EventName::UpdateKey(key), Event::Update(change.clone()));
      self.emit(EventName::Update, Event::Update(change));
    }
  }

  fn emit_error(self: &Arc<Self>, error: Error) {
    self.emit(EventName::Error, Event::Error(Arc::new(error)));
  }

  fn emit(self: &Arc<Self>, name: EventName, event: Event) {
    let (callbacks, fired_once) = {
      let mut inner = self.inner.lock();
      let callbacks: Vec<Listener> = inner
        .listeners
        .iter()
        .filter(|r| r.name == name)
        .map(|r| r.callback.clone())
        .collect();
      let before = inner.listeners.len();
      inner.listeners.retain(|r| !(r.once && r.name == name));
      (callbacks, inner.listeners.len() != before)
    };

    if callbacks.is_empty() {
      if let Event::Error(err) = &event {
        log::warn!("[{}] Unhandled error: {}", self.device, err);
      }
    }

    for callback in callbacks {
      let result = catch_unwind(AssertUnwindSafe(|| callback(&event))).unwrap_or_else(|panic| {
        let message = panic
          .downcast_ref::<&str>()
          .map(|s| s.to_string())
          .or_else(|| panic.downcast_ref::<String>().cloned())
          .unwrap_or_else(|| "listener panicked".to_string());
        Err(message.into())
      });

      if let Err(e) = result {
        if name == EventName::Error {
          log::error!("[{}] Error listener failed: {}", self.device, e);
        } else {
          self.emit_error(Error::Listener(e));
        }
      }
    }

    if fired_once {
      self.reconcile();
    }
  }
}

impl Drop for Shared {
  fn drop(&mut self) {
    let inner = self.inner.get_mut();
    if let Some(restart) = inner.restart.take() {
      restart.cancel();
    }
    if let Some(process) = inner.process.take() {
      process.handle.kill();
    }
  }
}

/// Output devices are equal when they hold the same identifiers, in any order.
/// NaN equals NaN, so an unchanged NaN is not reported again.
fn values_equal(old: &Option<StateValue>, new: &Option<StateValue>) -> bool {
  match (old, new) {
    (Some(StateValue::Number(a)), Some(StateValue::Number(b))) => {
      a == b || (a.is_nan() && b.is_nan())
    }
    (Some(StateValue::OutputDevices(a)), Some(StateValue::OutputDevices(b))) => {
      let mut a: Vec<&str> = a.iter().map(|d| d.identifier.as_str()).collect();
      let mut b: Vec<&str> = b.iter().map(|d| d.identifier.as_str()).collect();
      a.sort_unstable();
      b.sort_unstable();
      a == b
    }
    _ => old == new,
  }
}

/// Longest stdout line accepted from atvscript, in bytes.
const MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum Line {
  Text(String),
  /// A line longer than the limit was dropped.
  Oversized,
}

/// Splits a byte stream into lines of bounded length.
struct LineBuffer {
  pending: Vec<u8>,
  limit: usize,
  /// Skipping the rest of an oversized line.
  discarding: bool,
}

impl Default for LineBuffer {
  fn default() -> Self {
    Self::with_limit(MAX_LINE_LEN)
  }
}

impl LineBuffer {
  fn with_limit(limit: usize) -> Self {
    Self {
      pending: Vec::new(),
      limit,
      discarding: false,
    }
  }

  fn push(&mut self, chunk: &[u8]) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut rest = chunk;

    while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
      if self.discarding {
        self.discarding = false;
      } else if self.pending.len() + pos > self.limit {
        lines.push(Line::Oversized);
      } else {
        self.pending.extend_from_slice(&rest[..pos]);
        lines.push(Line::Text(decode_line(&self.pending)));
      }
      self.pending.clear();
      rest = &rest[pos + 1..];
    }

    if !self.discarding {
      if self.pending.len() + rest.len() > self.limit {
        self.pending.clear();
        self.discarding = true;
        lines.push(Line::Oversized);
      } else {
        self.pending.extend_from_slice(rest);
      }
    }
    lines
  }

  fn finish(&mut self) -> Option<String> {
    if self.discarding || self.pending.is_empty() {
      return None;
    }
    let line = decode_line(&self.pending);
    self.pending.clear();
    Some(line)
  }
}

fn decode_line(bytes: &[u8]) -> String {
  String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}

/// Feeds one process's output into the state machine until it exits.
async fn pump(
  shared: Weak<Shared>,
  generation: u64,
  events: Receiver<ProcessEvent>,
  trace: TraceId,
) {
  let mut lines = LineBuffer::default();

  while let Ok(event) = events.recv().await {
    let Some(shared) = shared.upgrade() else {
      break;
    };

    match event {
      ProcessEvent::Stdout(chunk) => {
        for line in lines.push(&chunk) {
          match line {
            Line::Text(line) => shared.handle_line(generation, &line, trace),
            Line::Oversized => {
              log::warn!("[{}] Dropping stdout line longer than {} bytes", trace, MAX_LINE_LEN);
              if shared.is_current(generation) {
                shared.emit_error(Error::Parse {
                  line: String::new(),
                  reason: format!("line longer than {} bytes", MAX_LINE_LEN),
                });
              }
            }
          }
        }
      }
      ProcessEvent::Stderr(line) => {
        if shared.is_current(generation) {
          shared.emit_error(Error::Stderr(line));
        }
      }
      ProcessEvent::Error(e) => {
        if shared.is_current(generation) {
          shared.emit_error(Error::Io(e));
        }
      }
      ProcessEvent::Exit(code) => {
        if let Some(line) = lines.finish() {
          shared.handle_line(generation, &line, trace);
        }
        shared.handle_exit(generation, code);
        break;
      }
    }
  }
  log::debug!("[{}] Push update pump finished", trace);
}
