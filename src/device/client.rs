//! High-level device client.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::error::{Error, ListenerError, Result};
use super::events::{DeviceEvents, ListenerId};
use super::state::{device_exception, parse_state};
use super::types::{
  DeviceRef, DeviceState, Event, EventName, FocusState, ListenerState, MediaType, OutputDevice,
  PowerState, RepeatState, ShuffleState, StateSnapshot,
};
use crate::config::{DeviceOptions, ListenerTimings};
use crate::script::{request_json, Key, ProcessRunner, ScriptCommand, TokioProcessRunner, TraceId};

/// Generates an attribute getter that reads through [`Device::get_state`].
macro_rules! state_getter {
  ($(#[$meta:meta])* $name:ident: $ty:ty) => {
    $(#[$meta])*
    pub async fn $name(&self) -> Result<Option<$ty>> {
      Ok(self.get_state().await?.$name)
    }
  };
}

/// One Apple TV.
///
/// Registering a listener subscribes to push updates, removing the last one
/// ends the subscription. Attribute getters poll on demand and feed the same
/// cached state, so polling and listening never report a change twice.
pub struct Device {
  options: Arc<DeviceOptions>,
  device: DeviceRef,
  runner: Arc<dyn ProcessRunner>,
  events: DeviceEvents,
  refreshed_at: Mutex<Option<Instant>>,
}

impl Device {
  /// Create a device that runs the real `atvscript`.
  pub fn new(options: DeviceOptions) -> Result<Self> {
    Self::with_runner(
      options,
      ListenerTimings::default(),
      Arc::new(TokioProcessRunner::new()),
    )
  }

  /// Create a device on top of a custom process runner.
  pub fn with_runner(
    options: DeviceOptions,
    timings: ListenerTimings,
    runner: Arc<dyn ProcessRunner>,
  ) -> Result<Self> {
    options.validate().map_err(Error::InvalidConfig)?;
    let options = Arc::new(options);
    log::debug!("Creating device {} ({})", options.name, options.host);

    Ok(Self {
      device: DeviceRef::new(options.clone()),
      events: DeviceEvents::new(options.clone(), timings, runner.clone()),
      options,
      runner,
      refreshed_at: Mutex::new(None),
    })
  }

  pub fn host(&self) -> &str {
    &self.options.host
  }

  pub fn name(&self) -> &str {
    &self.options.name
  }

  pub fn id(&self) -> Option<&str> {
    self.options.id.as_deref()
  }

  pub fn protocol(&self) -> Option<&str> {
    self.options.protocol.as_deref()
  }

  pub fn options(&self) -> &DeviceOptions {
    &self.options
  }

  /// Reference handed out with every change event.
  pub fn device_ref(&self) -> DeviceRef {
    self.device.clone()
  }

  pub fn listener_state(&self) -> ListenerState {
    self.events.listener_state()
  }

  /// Shorthand for [`Device::add_listener`].
  pub fn on<F>(&self, name: EventName, listener: F) -> ListenerId
  where
    F: Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
  {
    self.events.add_listener(name, listener)
  }

  pub fn add_listener<F>(&self, name: EventName, listener: F) -> ListenerId
  where
    F: Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
  {
    self.events.add_listener(name, listener)
  }

  pub fn prepend_listener<F>(&self, name: EventName, listener: F) -> ListenerId
  where
    F: Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
  {
    self.events.prepend_listener(name, listener)
  }

  pub fn once<F>(&self, name: EventName, listener: F) -> ListenerId
  where
    F: Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
  {
    self.events.once(name, listener)
  }

  pub fn remove_listener(&self, id: ListenerId) -> bool {
    self.events.remove_listener(id)
  }

  pub fn remove_all_listeners(&self, name: Option<EventName>) {
    self.events.remove_all_listeners(name)
  }

  pub fn listener_count(&self, name: Option<EventName>) -> usize {
    self.events.listener_count(name)
  }

  /// Diff `new_state` against the cached state and emit change events.
  pub fn apply_state_and_emit_events(&self, new_state: &StateSnapshot) {
    self.events.apply_state_and_emit_events(new_state)
  }

  /// Current state.
  ///
  /// Served from cache when it was polled less than `state_max_age` ago,
  /// otherwise queried with `atvscript playing`. The result goes through the
  /// same diff as push updates, so listeners see polled changes too.
  pub async fn get_state(&self) -> Result<StateSnapshot> {
    if let Some(refreshed_at) = *self.refreshed_at.lock() {
      if refreshed_at.elapsed() < self.options.state_max_age() {
        return Ok(self.events.state());
      }
    }

    let trace = TraceId::new();
    log::debug!("[{}] Polling state of {}", trace, self.device);
    let command = ScriptCommand::playing(&self.options);
    let response = request_json(self.runner.as_ref(), &command, trace).await?;
    let snapshot = parse_state(Some(&response), trace)?;

    self.events.apply_state_and_emit_events(&snapshot);
    *self.refreshed_at.lock() = Some(Instant::now());
    Ok(snapshot)
  }

  /// Forget the cached state, the next read polls the device.
  pub fn clear_state(&self) {
    self.events.clear_state();
    *self.refreshed_at.lock() = None;
  }

  state_getter!(date_time: DateTime<FixedOffset>);
  state_getter!(hash: String);
  state_getter!(media_type: MediaType);
  state_getter!(device_state: DeviceState);
  state_getter!(title: String);
  state_getter!(artist: String);
  state_getter!(album: String);
  state_getter!(genre: String);
  state_getter!(
    /// Length of the current item in seconds.
    total_time: f64
  );
  state_getter!(
    /// Playback position in seconds.
    position: f64
  );
  state_getter!(shuffle: ShuffleState);
  state_getter!(repeat: RepeatState);
  state_getter!(
    /// Name of the app in the foreground.
    app: String
  );
  state_getter!(
    /// Bundle id of the app in the foreground.
    app_id: String
  );
  state_getter!(power_state: PowerState);
  state_getter!(volume: f64);
  state_getter!(focus_state: FocusState);
  state_getter!(output_devices: Vec<OutputDevice>);

  /// Press a remote control key.
  pub async fn press_key(&self, key: Key) -> Result<()> {
    let trace = TraceId::new();
    log::info!("[{}] Pressing {} on {}", trace, key, self.device);

    let command = ScriptCommand::key(&self.options, key);
    let response = request_json(self.runner.as_ref(), &command, trace).await?;

    if let Some(record) = response.as_object() {
      if let Some(err) = device_exception(record) {
        log::warn!("[{}] Key {} failed: {}", trace, key, err);
        return Err(err);
      }
    }
    match response.get("result").and_then(Value::as_str) {
      Some("success") => Ok(()),
      _ => Err(Error::UnexpectedResponse(response.to_string())),
    }
  }

  pub async fn down(&self) -> Result<()> {
    self.press_key(Key::Down).await
  }

  pub async fn up(&self) -> Result<()> {
    self.press_key(Key::Up).await
  }

  pub async fn left(&self) -> Result<()> {
    self.press_key(Key::Left).await
  }

  pub async fn right(&self) -> Result<()> {
    self.press_key(Key::Right).await
  }

  pub async fn select(&self) -> Result<()> {
    self.press_key(Key::Select).await
  }

  pub async fn menu(&self) -> Result<()> {
    self.press_key(Key::Menu).await
  }

  pub async fn home(&self) -> Result<()> {
    self.press_key(Key::Home).await
  }

  pub async fn play(&self) -> Result<()> {
    self.press_key(Key::Play).await
  }

  pub async fn pause(&self) -> Result<()> {
    self.press_key(Key::Pause).await
  }

  pub async fn play_pause(&self) -> Result<()> {
    self.press_key(Key::PlayPause).await
  }

  pub async fn stop(&self) -> Result<()> {
    self.press_key(Key::Stop).await
  }

  pub async fn next(&self) -> Result<()> {
    self.press_key(Key::Next).await
  }

  pub async fn previous(&self) -> Result<()> {
    self.press_key(Key::Previous).await
  }

  pub async fn turn_on(&self) -> Result<()> {
    self.press_key(Key::TurnOn).await
  }

  pub async fn turn_off(&self) -> Result<()> {
    self.press_key(Key::TurnOff).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::script::fake::{FakeProcessRunner, FakeScript};
  use crate::script::ProcessError;
  use std::time::Duration;

  const PLAYING: &str = r#"{"result":"success","datetime":"2024-03-01T20:00:00+01:00","media_type":"video","device_state":"playing","title":"My Movie","position":12,"total_time":5400,"app":"Netflix","app_id":"com.netflix.Netflix"}"#;

  fn setup() -> (Device, FakeProcessRunner) {
    let runner = FakeProcessRunner::new();
    let mut options = DeviceOptions::new("192.168.178.20").with_name("Living Room");
    options.atvscript_path = Some("atvscript".to_string());
    let device = Device::with_runner(
      options,
      ListenerTimings::default(),
      Arc::new(runner.clone()),
    )
    .unwrap();
    (device, runner)
  }

  #[test]
  fn test_invalid_options_are_rejected() {
    let result = Device::with_runner(
      DeviceOptions::new(""),
      ListenerTimings::default(),
      Arc::new(FakeProcessRunner::new()),
    );
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_state_polls_then_serves_cache() {
    let (device, runner) = setup();
    runner.enqueue(FakeScript::stdout(PLAYING).exit(0));

    let state = device.get_state().await.unwrap();
    assert_eq!(state.title.as_deref(), Some("My Movie"));
    assert_eq!(state.device_state, Some(DeviceState::Playing));
    assert_eq!(runner.spawns()[0].args, vec!["-s", "192.168.178.20", "playing"]);

    assert_eq!(device.app_id().await.unwrap().as_deref(), Some("com.netflix.Netflix"));
    assert_eq!(device.position().await.unwrap(), Some(12.0));
    assert_eq!(runner.spawn_count(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    runner.enqueue(FakeScript::stdout(r#"{"result":"success","title":"Other"}"#).exit(0));
    assert_eq!(device.title().await.unwrap().as_deref(), Some("Other"));
    assert_eq!(runner.spawn_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_state_forces_poll() {
    let (device, runner) = setup();
    runner.enqueue(FakeScript::stdout(PLAYING).exit(0));
    device.get_state().await.unwrap();

    device.clear_state();
    runner.enqueue(FakeScript::stdout(PLAYING).exit(0));
    let state = device.get_state().await.unwrap();

    assert_eq!(state.title.as_deref(), Some("My Movie"));
    assert_eq!(runner.spawn_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_polling_emits_updates_once() {
    let (device, runner) = setup();
    let titles = Arc::new(Mutex::new(Vec::new()));
    let seen = titles.clone();
    device.on(EventName::UpdateKey(crate::device::StateKey::Title), move |event| {
      if let Some(change) = event.as_update() {
        seen.lock().push(change.new_value.clone());
      }
      Ok(())
    });
    assert_eq!(device.listener_state(), ListenerState::Starting);

    runner.enqueue(FakeScript::stdout(PLAYING).exit(0));
    device.get_state().await.unwrap();
    device.clear_state();
    runner.enqueue(FakeScript::stdout(PLAYING).exit(0));
    device.get_state().await.unwrap();

    // The second poll diffs against the cleared cache
    assert_eq!(titles.lock().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_state_exception_leaves_cache_alone() {
    let (device, runner) = setup();
    runner.enqueue(
      FakeScript::stdout(r#"{"result":"failure","exception":"invalid credentials: 321"}"#).exit(1),
    );

    let err = device.get_state().await.unwrap_err();
    assert!(err.to_string().contains("invalid credentials: 321"));
    assert!(device.events.state().is_unknown());
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_state_stderr_only_fails() {
    let (device, runner) = setup();
    runner.enqueue(FakeScript::default().stderr_line("Traceback").exit(1));

    let err = device.get_state().await.unwrap_err();
    assert!(matches!(err, Error::Process(ProcessError::Failed { .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn test_press_key() {
    let (device, runner) = setup();
    runner.enqueue(FakeScript::stdout(r#"{"result":"success","command":"play_pause"}"#).exit(0));

    device.play_pause().await.unwrap();
    assert_eq!(
      runner.spawns()[0].args,
      vec!["-s", "192.168.178.20", "play_pause"]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_press_key_failures() {
    let (device, runner) = setup();
    runner.enqueue(FakeScript::stdout(r#"{"result":"failure","exception":"not connected"}"#).exit(1));
    runner.enqueue(FakeScript::stdout(r#"{"result":"nope"}"#).exit(0));

    let err = device.press_key(Key::Menu).await.unwrap_err();
    assert!(matches!(err, Error::Device { ref message, .. } if message == "not connected"));

    let err = device.press_key(Key::Menu).await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedResponse(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_listener_registration_drives_subscription() {
    let (device, runner) = setup();
    let id = device.on(EventName::Update, |_| Ok(()));
    device.once(EventName::Close, |_| Ok(()));
    assert_eq!(device.listener_count(None), 2);
    assert_eq!(runner.spawns()[0].args.last().map(String::as_str), Some("push_updates"));

    device.remove_listener(id);
    device.remove_all_listeners(None);
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(device.listener_count(None), 0);
    assert_eq!(device.listener_state(), ListenerState::Stopped);
    assert_eq!(runner.spawn_count(), 1);
  }

  #[test]
  fn test_identity() {
    let (device, _) = setup();
    assert_eq!(device.host(), "192.168.178.20");
    assert_eq!(device.name(), "Living Room");
    assert_eq!(device.id(), None);
    assert_eq!(device.device_ref().to_string(), "Living Room (192.168.178.20)");
  }
}
