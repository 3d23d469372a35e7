//! atvscript command lines and log correlation ids.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::process::resolve_program;
use crate::config::DeviceOptions;

pub const ATVSCRIPT: &str = "atvscript";

/// Correlation id prefixed to every log line of one request or subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(Uuid);

impl TraceId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for TraceId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for TraceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let simple = self.0.simple().to_string();
    f.write_str(&simple[..8])
  }
}

/// Remote control keys understood by atvscript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
  Down,
  Home,
  HomeHold,
  Left,
  Menu,
  Next,
  Pause,
  Play,
  PlayPause,
  Previous,
  Right,
  Select,
  SkipBackward,
  SkipForward,
  Stop,
  Suspend,
  TopMenu,
  TurnOff,
  TurnOn,
  Up,
  VolumeDown,
  VolumeUp,
  Wakeup,
}

impl Key {
  pub fn as_str(&self) -> &'static str {
    match self {
      Key::Down => "down",
      Key::Home => "home",
      Key::HomeHold => "home_hold",
      Key::Left => "left",
      Key::Menu => "menu",
      Key::Next => "next",
      Key::Pause => "pause",
      Key::Play => "play",
      Key::PlayPause => "play_pause",
      Key::Previous => "previous",
      Key::Right => "right",
      Key::Select => "select",
      Key::SkipBackward => "skip_backward",
      Key::SkipForward => "skip_forward",
      Key::Stop => "stop",
      Key::Suspend => "suspend",
      Key::TopMenu => "top_menu",
      Key::TurnOff => "turn_off",
      Key::TurnOn => "turn_on",
      Key::Up => "up",
      Key::VolumeDown => "volume_down",
      Key::VolumeUp => "volume_up",
      Key::Wakeup => "wakeup",
    }
  }
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Connection parameters shared by every atvscript invocation.
pub fn connection_args(options: &DeviceOptions) -> Vec<String> {
  let mut args = vec!["-s".to_string(), options.host.clone()];

  let optional = [
    ("-i", &options.id),
    ("--protocol", &options.protocol),
    ("--airplay-credentials", &options.airplay_credentials),
    ("--companion-credentials", &options.companion_credentials),
    ("--dmap-credentials", &options.dmap_credentials),
    ("--mrp-credentials", &options.mrp_credentials),
    ("--raop-credentials", &options.raop_credentials),
  ];
  for (flag, value) in optional {
    if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
      args.push(flag.to_string());
      args.push(value.clone());
    }
  }

  args
}

/// One atvscript invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
  pub program: String,
  pub args: Vec<String>,
}

impl ScriptCommand {
  /// Command with connection parameters followed by `subcommand`.
  pub fn new(options: &DeviceOptions, subcommand: &str) -> Self {
    let mut args = connection_args(options);
    args.push(subcommand.to_string());
    Self {
      program: resolve_program(options.atvscript_path.as_deref(), ATVSCRIPT),
      args,
    }
  }

  /// Long-running stream of state updates, one JSON object per line.
  pub fn push_updates(options: &DeviceOptions) -> Self {
    Self::new(options, "push_updates")
  }

  /// One-shot query of the current playing state.
  pub fn playing(options: &DeviceOptions) -> Self {
    Self::new(options, "playing")
  }

  /// Press a remote control key.
  pub fn key(options: &DeviceOptions, key: Key) -> Self {
    Self::new(options, key.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn options() -> DeviceOptions {
    let mut options = DeviceOptions::new("192.168.178.2").with_id("AA:BB").with_protocol("mrp");
    options.atvscript_path = Some("/usr/bin/atvscript".to_string());
    options.mrp_credentials = Some("1234".to_string());
    options.airplay_credentials = Some(String::new());
    options
  }

  #[test]
  fn test_push_updates_command() {
    let cmd = ScriptCommand::push_updates(&options());
    assert_eq!(cmd.program, "/usr/bin/atvscript");
    assert_eq!(
      cmd.args,
      vec![
        "-s",
        "192.168.178.2",
        "-i",
        "AA:BB",
        "--protocol",
        "mrp",
        "--mrp-credentials",
        "1234",
        "push_updates"
      ]
    );
  }

  #[test]
  fn test_key_command() {
    let cmd = ScriptCommand::key(&options(), Key::PlayPause);
    assert_eq!(cmd.args.last().map(String::as_str), Some("play_pause"));
  }

  #[test]
  fn test_key_serde_matches_cli_name() {
    let json = serde_json::to_string(&Key::SkipBackward).unwrap();
    assert_eq!(json, "\"skip_backward\"");
  }

  #[test]
  fn test_trace_id_is_short() {
    assert_eq!(TraceId::new().to_string().len(), 8);
  }
}
