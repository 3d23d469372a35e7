//! Device state and event types.
//!
//! A [`StateSnapshot`] holds every attribute atvscript reports, each either a
//! value or unknown (`None`).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::error::Error;
use crate::config::DeviceOptions;

macro_rules! state_enum {
  ($(#[$meta:meta])* $name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
    $(#[$meta])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum $name {
      $(
        #[serde(rename = $value)]
        $variant,
      )+
    }

    impl $name {
      /// Allowed values, as reported by atvscript.
      pub const VALUES: &'static [&'static str] = &[$($value),+];

      pub fn as_str(&self) -> &'static str {
        match self {
          $($name::$variant => $value,)+
        }
      }

      /// `None` for anything outside [`Self::VALUES`].
      pub fn from_name(name: &str) -> Option<Self> {
        match name {
          $($value => Some($name::$variant),)+
          _ => None,
        }
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
      }
    }
  };
}

state_enum!(
  /// Kind of media currently playing.
  MediaType {
    Unknown => "unknown",
    Video => "video",
    Music => "music",
    Tv => "tv",
  }
);

state_enum!(
  /// Playback state.
  DeviceState {
    Idle => "idle",
    Loading => "loading",
    Paused => "paused",
    Playing => "playing",
    Stopped => "stopped",
    Seeking => "seeking",
  }
);

state_enum!(
  ShuffleState {
    Off => "off",
    Songs => "songs",
    Albums => "albums",
  }
);

state_enum!(
  RepeatState {
    Off => "off",
    Track => "track",
    All => "all",
  }
);

state_enum!(
  PowerState {
    On => "on",
    Off => "off",
  }
);

state_enum!(
  FocusState {
    Focused => "focused",
    Unfocused => "unfocused",
  }
);

/// Audio output the device currently plays to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputDevice {
  #[serde(default)]
  pub name: String,
  pub identifier: String,
}

/// Attribute names of a [`StateSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateKey {
  DateTime,
  Hash,
  MediaType,
  DeviceState,
  Title,
  Artist,
  Album,
  Genre,
  TotalTime,
  Position,
  Shuffle,
  Repeat,
  App,
  AppId,
  PowerState,
  Volume,
  FocusState,
  OutputDevices,
}

impl StateKey {
  pub const ALL: [StateKey; 18] = [
    StateKey::DateTime,
    StateKey::Hash,
    StateKey::MediaType,
    StateKey::DeviceState,
    StateKey::Title,
    StateKey::Artist,
    StateKey::Album,
    StateKey::Genre,
    StateKey::TotalTime,
    StateKey::Position,
    StateKey::Shuffle,
    StateKey::Repeat,
    StateKey::App,
    StateKey::AppId,
    StateKey::PowerState,
    StateKey::Volume,
    StateKey::FocusState,
    StateKey::OutputDevices,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      StateKey::DateTime => "dateTime",
      StateKey::Hash => "hash",
      StateKey::MediaType => "mediaType",
      StateKey::DeviceState => "deviceState",
      StateKey::Title => "title",
      StateKey::Artist => "artist",
      StateKey::Album => "album",
      StateKey::Genre => "genre",
      StateKey::TotalTime => "totalTime",
      StateKey::Position => "position",
      StateKey::Shuffle => "shuffle",
      StateKey::Repeat => "repeat",
      StateKey::App => "app",
      StateKey::AppId => "appId",
      StateKey::PowerState => "powerState",
      StateKey::Volume => "volume",
      StateKey::FocusState => "focusState",
      StateKey::OutputDevices => "outputDevices",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    Self::ALL.iter().copied().find(|key| key.as_str() == name)
  }
}

impl fmt::Display for StateKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Value of one known attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
  Text(String),
  Number(f64),
  MediaType(MediaType),
  DeviceState(DeviceState),
  Shuffle(ShuffleState),
  Repeat(RepeatState),
  PowerState(PowerState),
  FocusState(FocusState),
  DateTime(DateTime<FixedOffset>),
  OutputDevices(Vec<OutputDevice>),
}

/// Normalized device state. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
  pub date_time: Option<DateTime<FixedOffset>>,
  pub hash: Option<String>,
  pub media_type: Option<MediaType>,
  pub device_state: Option<DeviceState>,
  pub title: Option<String>,
  pub artist: Option<String>,
  pub album: Option<String>,
  pub genre: Option<String>,
  pub total_time: Option<f64>,
  pub position: Option<f64>,
  pub shuffle: Option<ShuffleState>,
  pub repeat: Option<RepeatState>,
  pub app: Option<String>,
  pub app_id: Option<String>,
  pub power_state: Option<PowerState>,
  pub volume: Option<f64>,
  pub focus_state: Option<FocusState>,
  pub output_devices: Option<Vec<OutputDevice>>,
}

impl StateSnapshot {
  /// Value of `key`, `None` when unknown.
  pub fn get(&self, key: StateKey) -> Option<StateValue> {
    match key {
      StateKey::DateTime => self.date_time.map(StateValue::DateTime),
      StateKey::Hash => self.hash.clone().map(StateValue::Text),
      StateKey::MediaType => self.media_type.map(StateValue::MediaType),
      StateKey::DeviceState => self.device_state.map(StateValue::DeviceState),
      StateKey::Title => self.title.clone().map(StateValue::Text),
      StateKey::Artist => self.artist.clone().map(StateValue::Text),
      StateKey::Album => self.album.clone().map(StateValue::Text),
      StateKey::Genre => self.genre.clone().map(StateValue::Text),
      StateKey::TotalTime => self.total_time.map(StateValue::Number),
      StateKey::Position => self.position.map(StateValue::Number),
      StateKey::Shuffle => self.shuffle.map(StateValue::Shuffle),
      StateKey::Repeat => self.repeat.map(StateValue::Repeat),
      StateKey::App => self.app.clone().map(StateValue::Text),
      StateKey::AppId => self.app_id.clone().map(StateValue::Text),
      StateKey::PowerState => self.power_state.map(StateValue::PowerState),
      StateKey::Volume => self.volume.map(StateValue::Number),
      StateKey::FocusState => self.focus_state.map(StateValue::FocusState),
      StateKey::OutputDevices => self.output_devices.clone().map(StateValue::OutputDevices),
    }
  }

  /// Whether `key` is known.
  pub fn has(&self, key: StateKey) -> bool {
    match key {
      StateKey::DateTime => self.date_time.is_some(),
      StateKey::Hash => self.hash.is_some(),
      StateKey::MediaType => self.media_type.is_some(),
      StateKey::DeviceState => self.device_state.is_some(),
      StateKey::Title => self.title.is_some(),
      StateKey::Artist => self.artist.is_some(),
      StateKey::Album => self.album.is_some(),
      StateKey::Genre => self.genre.is_some(),
      StateKey::TotalTime => self.total_time.is_some(),
      StateKey::Position => self.position.is_some(),
      StateKey::Shuffle => self.shuffle.is_some(),
      StateKey::Repeat => self.repeat.is_some(),
      StateKey::App => self.app.is_some(),
      StateKey::AppId => self.app_id.is_some(),
      StateKey::PowerState => self.power_state.is_some(),
      StateKey::Volume => self.volume.is_some(),
      StateKey::FocusState => self.focus_state.is_some(),
      StateKey::OutputDevices => self.output_devices.is_some(),
    }
  }

  /// Copy the value of `key` from `other`.
  pub fn copy_field(&mut self, other: &StateSnapshot, key: StateKey) {
    match key {
      StateKey::DateTime => self.date_time = other.date_time,
      StateKey::Hash => self.hash = other.hash.clone(),
      StateKey::MediaType => self.media_type = other.media_type,
      StateKey::DeviceState => self.device_state = other.device_state,
      StateKey::Title => self.title = other.title.clone(),
      StateKey::Artist => self.artist = other.artist.clone(),
      StateKey::Album => self.album = other.album.clone(),
      StateKey::Genre => self.genre = other.genre.clone(),
      StateKey::TotalTime => self.total_time = other.total_time,
      StateKey::Position => self.position = other.position,
      StateKey::Shuffle => self.shuffle = other.shuffle,
      StateKey::Repeat => self.repeat = other.repeat,
      StateKey::App => self.app = other.app.clone(),
      StateKey::AppId => self.app_id = other.app_id.clone(),
      StateKey::PowerState => self.power_state = other.power_state,
      StateKey::Volume => self.volume = other.volume,
      StateKey::FocusState => self.focus_state = other.focus_state,
      StateKey::OutputDevices => self.output_devices = other.output_devices.clone(),
    }
  }

  /// True when nothing but the timestamp is known.
  pub fn is_unknown(&self) -> bool {
    StateKey::ALL
      .iter()
      .filter(|key| **key != StateKey::DateTime)
      .all(|key| !self.has(*key))
  }
}

/// Read-only reference to the device an event belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRef(Arc<DeviceOptions>);

impl DeviceRef {
  pub fn new(options: Arc<DeviceOptions>) -> Self {
    Self(options)
  }

  pub fn host(&self) -> &str {
    &self.0.host
  }

  pub fn name(&self) -> &str {
    &self.0.name
  }

  pub fn id(&self) -> Option<&str> {
    self.0.id.as_deref()
  }
}

impl fmt::Display for DeviceRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.0.name, self.0.host)
  }
}

/// One attribute changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
  pub key: StateKey,
  pub old_value: Option<StateValue>,
  pub new_value: Option<StateValue>,
  pub device: DeviceRef,
}

/// Lifecycle of the push update subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenerState {
  Stopped,
  Starting,
  Started,
  Stopping,
}

/// Names listeners register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
  /// Any attribute changed (`update`).
  Update,
  /// One attribute changed (`update:<key>`).
  UpdateKey(StateKey),
  Error,
  /// The push update subprocess exited.
  Close,
}

impl fmt::Display for EventName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EventName::Update => f.write_str("update"),
      EventName::UpdateKey(key) => write!(f, "update:{}", key),
      EventName::Error => f.write_str("error"),
      EventName::Close => f.write_str("close"),
    }
  }
}

impl FromStr for EventName {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "update" => Ok(EventName::Update),
      "error" => Ok(EventName::Error),
      "close" => Ok(EventName::Close),
      _ => s
        .strip_prefix("update:")
        .and_then(StateKey::from_name)
        .map(EventName::UpdateKey)
        .ok_or_else(|| format!("Unknown event: {}", s)),
    }
  }
}

/// Payload delivered to listeners.
#[derive(Debug, Clone)]
pub enum Event {
  Update(ChangeEvent),
  Error(Arc<Error>),
  Close,
}

impl Event {
  pub fn as_update(&self) -> Option<&ChangeEvent> {
    match self {
      Event::Update(change) => Some(change),
      _ => None,
    }
  }

  pub fn as_error(&self) -> Option<&Error> {
    match self {
      Event::Error(err) => Some(err.as_ref()),
      _ => None,
    }
  }
}
