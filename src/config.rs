//! Device connection options and listener timings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection options for one Apple TV.
///
/// Every set field is turned into a command line parameter for `atvscript`,
/// see [`crate::script::connection_args`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOptions {
  /// IP address or hostname of the device.
  pub host: String,

  /// Display name, used in log lines.
  #[serde(default = "default_device_name")]
  pub name: String,

  /// Device identifier (`-i`).
  #[serde(default)]
  pub id: Option<String>,

  /// Protocol to connect with (`--protocol`), e.g. `mrp` or `companion`.
  #[serde(default)]
  pub protocol: Option<String>,

  #[serde(default)]
  pub airplay_credentials: Option<String>,

  #[serde(default)]
  pub companion_credentials: Option<String>,

  #[serde(default)]
  pub dmap_credentials: Option<String>,

  #[serde(default)]
  pub mrp_credentials: Option<String>,

  #[serde(default)]
  pub raop_credentials: Option<String>,

  /// Custom `atvscript` executable path (None = auto-detect).
  #[serde(default)]
  pub atvscript_path: Option<String>,

  /// How long a polled state is served from cache, in milliseconds.
  #[serde(default = "default_state_max_age_ms")]
  pub state_max_age_ms: u64,
}

fn default_device_name() -> String {
  "Apple TV".to_string()
}

fn default_state_max_age_ms() -> u64 {
  100
}

impl DeviceOptions {
  /// Options for a device reachable at `host` with everything else defaulted.
  pub fn new(host: impl Into<String>) -> Self {
    Self {
      host: host.into(),
      name: default_device_name(),
      id: None,
      protocol: None,
      airplay_credentials: None,
      companion_credentials: None,
      dmap_credentials: None,
      mrp_credentials: None,
      raop_credentials: None,
      atvscript_path: None,
      state_max_age_ms: default_state_max_age_ms(),
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }

  pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
    self.protocol = Some(protocol.into());
    self
  }

  pub fn state_max_age(&self) -> Duration {
    Duration::from_millis(self.state_max_age_ms)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.host.trim().is_empty() {
      return Err("Host cannot be empty".to_string());
    }
    if self.name.trim().is_empty() {
      return Err("Device name cannot be empty".to_string());
    }
    if let Some(protocol) = &self.protocol {
      if !matches!(protocol.as_str(), "airplay" | "companion" | "dmap" | "mrp" | "raop") {
        return Err(format!("Unknown protocol: {}", protocol));
      }
    }
    Ok(())
  }
}

/// Timings of the push update subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTimings {
  /// A subprocess exiting sooner than this after its start counts as a crash.
  #[serde(default = "default_crash_threshold_ms")]
  pub crash_threshold_ms: u64,

  /// Cool-down before restarting after a crash.
  #[serde(default = "default_restart_delay_ms")]
  pub restart_delay_ms: u64,

  /// How long a stopping subprocess gets to exit before it is killed.
  #[serde(default = "default_stop_grace_ms")]
  pub stop_grace_ms: u64,
}

fn default_crash_threshold_ms() -> u64 {
  30_000
}

fn default_restart_delay_ms() -> u64 {
  15_000
}

fn default_stop_grace_ms() -> u64 {
  250
}

impl Default for ListenerTimings {
  fn default() -> Self {
    Self {
      crash_threshold_ms: default_crash_threshold_ms(),
      restart_delay_ms: default_restart_delay_ms(),
      stop_grace_ms: default_stop_grace_ms(),
    }
  }
}

impl ListenerTimings {
  pub fn crash_threshold(&self) -> Duration {
    Duration::from_millis(self.crash_threshold_ms)
  }

  pub fn restart_delay(&self) -> Duration {
    Duration::from_millis(self.restart_delay_ms)
  }

  pub fn stop_grace(&self) -> Duration {
    Duration::from_millis(self.stop_grace_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_options_defaults_from_json() {
    let options: DeviceOptions =
      serde_json::from_str(r#"{"host":"192.168.1.2","mrpCredentials":"abc"}"#).unwrap();
    assert_eq!(options.name, "Apple TV");
    assert_eq!(options.mrp_credentials.as_deref(), Some("abc"));
    assert_eq!(options.state_max_age(), Duration::from_millis(100));
    assert!(options.validate().is_ok());
  }

  #[test]
  fn test_options_validation() {
    assert!(DeviceOptions::new(" ").validate().is_err());
    assert!(DeviceOptions::new("10.0.0.1")
      .with_protocol("telnet")
      .validate()
      .is_err());
    assert!(DeviceOptions::new("10.0.0.1")
      .with_protocol("companion")
      .validate()
      .is_ok());
  }

  #[test]
  fn test_default_timings() {
    let timings = ListenerTimings::default();
    assert_eq!(timings.crash_threshold(), Duration::from_secs(30));
    assert_eq!(timings.restart_delay(), Duration::from_secs(15));
    assert_eq!(timings.stop_grace(), Duration::from_millis(250));
  }
}
