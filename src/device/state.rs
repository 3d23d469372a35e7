//! Normalizes atvscript JSON records into [`StateSnapshot`]s.
//!
//! Fields are read one by one: a missing or malformed field becomes unknown
//! and is logged, the rest of the record is still used. Only a record with
//! an `exception` field fails as a whole.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde_json::{Map, Value};

use super::error::Error;
use super::types::{
  DeviceState, FocusState, MediaType, OutputDevice, PowerState, RepeatState, ShuffleState,
  StateSnapshot,
};
use crate::script::TraceId;

type Record = Map<String, Value>;

/// Parse one decoded record.
///
/// `None`, non-objects and empty objects yield an all-unknown snapshot.
pub fn parse_state(input: Option<&Value>, trace: TraceId) -> Result<StateSnapshot, Error> {
  let record = match input {
    Some(Value::Object(record)) if !record.is_empty() => record,
    Some(Value::Object(_)) | None => {
      log::debug!("[{}] Parse state: got empty input, return empty state", trace);
      return Ok(StateSnapshot::default());
    }
    Some(other) => {
      log::debug!("[{}] Parse state: got non-object input {}, return empty state", trace, other);
      return Ok(StateSnapshot::default());
    }
  };

  if let Some(err) = device_exception(record) {
    log::debug!("[{}] Parse state: got exception {}", trace, err);
    return Err(err);
  }

  Ok(StateSnapshot {
    date_time: parse_date_time(record, trace),
    hash: parse_string(record, "hash", trace),
    media_type: parse_enum(record, "media_type", MediaType::from_name, trace),
    device_state: parse_enum(record, "device_state", DeviceState::from_name, trace),
    title: parse_string(record, "title", trace),
    artist: parse_string(record, "artist", trace),
    album: parse_string(record, "album", trace),
    genre: parse_string(record, "genre", trace),
    total_time: parse_number(record, "total_time", trace),
    position: parse_number(record, "position", trace),
    shuffle: parse_enum(record, "shuffle", ShuffleState::from_name, trace),
    repeat: parse_enum(record, "repeat", RepeatState::from_name, trace),
    app: parse_string(record, "app", trace),
    app_id: parse_string(record, "app_id", trace),
    power_state: parse_enum(record, "power_state", PowerState::from_name, trace),
    volume: parse_number(record, "volume", trace),
    focus_state: parse_enum(record, "focus_state", FocusState::from_name, trace),
    output_devices: parse_output_devices(record, trace),
  })
}

/// The error a record reports through its `exception` field, if any.
pub fn device_exception(record: &Record) -> Option<Error> {
  let exception = record.get("exception").filter(|v| !v.is_null())?;
  let message = match exception {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  };
  let stacktrace = record
    .get("stacktrace")
    .and_then(Value::as_str)
    .map(str::to_string);
  Some(Error::Device { message, stacktrace })
}

/// Decode and parse one line of atvscript output.
pub fn parse_line(line: &str, trace: TraceId) -> Result<StateSnapshot, Error> {
  let value: Value = serde_json::from_str(line).map_err(|e| Error::Parse {
    line: line.to_string(),
    reason: e.to_string(),
  })?;
  parse_state(Some(&value), trace)
}

fn parse_string(record: &Record, field: &str, trace: TraceId) -> Option<String> {
  match record.get(field) {
    Some(Value::String(s)) => Some(s.clone()),
    Some(Value::Null) | None => {
      log::debug!("[{}] No {} in response", trace, field);
      None
    }
    Some(other) => {
      log::debug!("[{}] Unsupported {} value {}, ignore it", trace, field, other);
      None
    }
  }
}

fn parse_number(record: &Record, field: &str, trace: TraceId) -> Option<f64> {
  match record.get(field) {
    Some(Value::Number(n)) => n.as_f64(),
    Some(Value::Null) | None => {
      log::debug!("[{}] No {} in response", trace, field);
      None
    }
    Some(other) => {
      log::debug!("[{}] Unsupported {} value {}, ignore it", trace, field, other);
      None
    }
  }
}

fn parse_enum<T>(
  record: &Record,
  field: &str,
  from_name: fn(&str) -> Option<T>,
  trace: TraceId,
) -> Option<T> {
  let name = parse_string(record, field, trace)?;
  let value = from_name(&name);
  if value.is_none() {
    log::debug!("[{}] Unsupported {} value \"{}\", ignore it", trace, field, name);
  }
  value
}

fn parse_date_time(record: &Record, trace: TraceId) -> Option<DateTime<FixedOffset>> {
  let raw = parse_string(record, "datetime", trace)?;
  let parsed = DateTime::parse_from_rfc3339(&raw).ok().or_else(|| {
    // atvscript omits the offset on some platforms
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
      .ok()
      .map(|naive| naive.and_utc().fixed_offset())
  });
  if parsed.is_none() {
    log::debug!("[{}] Unable to parse datetime \"{}\", ignore it", trace, raw);
  }
  parsed
}

fn parse_output_devices(record: &Record, trace: TraceId) -> Option<Vec<OutputDevice>> {
  match record.get("output_devices") {
    Some(Value::Array(items)) => Some(
      items
        .iter()
        .filter_map(|item| match serde_json::from_value::<OutputDevice>(item.clone()) {
          Ok(device) => Some(device),
          Err(e) => {
            log::debug!("[{}] Unsupported output device {}: {}", trace, item, e);
            None
          }
        })
        .collect(),
    ),
    Some(Value::Null) | None => {
      log::debug!("[{}] No output_devices in response", trace);
      None
    }
    Some(other) => {
      log::debug!("[{}] Unsupported output_devices value {}, ignore it", trace, other);
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use serde_json::json;

  fn parse(value: Value) -> Result<StateSnapshot, Error> {
    parse_state(Some(&value), TraceId::new())
  }

  #[test]
  fn test_full_record() {
    let state = parse(json!({
      "result": "success",
      "datetime": "2020-11-07T22:38:43.608030+01:00",
      "hash": "100e0ab6-6ff5-4199-9c04-a7107ff78712",
      "media_type": "video",
      "device_state": "playing",
      "title": "Solo: A Star Wars Story",
      "artist": null,
      "album": null,
      "genre": null,
      "total_time": 8097,
      "position": 27,
      "shuffle": "off",
      "repeat": "off",
      "app": "Disney+",
      "app_id": "com.disney.disneyplus",
      "output_devices": [{"name": "Living Room", "identifier": "AA:BB"}]
    }))
    .unwrap();

    assert_eq!(state.title.as_deref(), Some("Solo: A Star Wars Story"));
    assert_eq!(state.media_type, Some(MediaType::Video));
    assert_eq!(state.device_state, Some(DeviceState::Playing));
    assert_eq!(state.total_time, Some(8097.0));
    assert_eq!(state.position, Some(27.0));
    assert_eq!(state.shuffle, Some(ShuffleState::Off));
    assert_eq!(state.repeat, Some(RepeatState::Off));
    assert_eq!(state.app_id.as_deref(), Some("com.disney.disneyplus"));
    assert_eq!(state.artist, None);
    assert_eq!(state.power_state, None);
    assert_eq!(
      state.date_time.map(|d| d.to_rfc3339()),
      Some("2020-11-07T22:38:43.608030+01:00".to_string())
    );
    assert_eq!(
      state.output_devices,
      Some(vec![OutputDevice {
        name: "Living Room".to_string(),
        identifier: "AA:BB".to_string()
      }])
    );
  }

  #[test]
  fn test_empty_input_is_unknown() {
    assert!(parse_state(None, TraceId::new()).unwrap().is_unknown());
    assert!(parse(json!({})).unwrap().is_unknown());
    assert!(parse(json!("playing")).unwrap().is_unknown());
    assert!(parse(json!([1, 2])).unwrap().is_unknown());
  }

  #[test]
  fn test_invalid_fields_degrade_individually() {
    let state = parse(json!({
      "title": 42,
      "artist": "Queen",
      "device_state": "dancing",
      "media_type": 3,
      "position": "12",
      "volume": 30,
      "output_devices": "none",
      "datetime": "yesterday"
    }))
    .unwrap();

    assert_eq!(state.title, None);
    assert_eq!(state.artist.as_deref(), Some("Queen"));
    assert_eq!(state.device_state, None);
    assert_eq!(state.media_type, None);
    assert_eq!(state.position, None);
    assert_eq!(state.volume, Some(30.0));
    assert_eq!(state.output_devices, None);
    assert_eq!(state.date_time, None);
  }

  #[test]
  fn test_datetime_without_offset() {
    let state = parse(json!({"datetime": "2021-01-02T03:04:05.123"})).unwrap();
    assert_eq!(
      state.date_time.map(|d| d.to_rfc3339()),
      Some("2021-01-02T03:04:05.123+00:00".to_string())
    );
  }

  #[test]
  fn test_partial_push_records() {
    let state = parse(json!({"power_state": "on"})).unwrap();
    assert_eq!(state.power_state, Some(PowerState::On));

    let state = parse(json!({"focus_state": "unfocused"})).unwrap();
    assert_eq!(state.focus_state, Some(FocusState::Unfocused));
  }

  #[test]
  fn test_exception_fails_record() {
    let err = parse(json!({
      "result": "failure",
      "exception": "invalid credentials: 321",
      "stacktrace": "Traceback (most recent call last):\n  foo"
    }))
    .unwrap_err();

    assert!(err.to_string().contains("invalid credentials: 321"));
    assert!(err.to_string().contains("Traceback"));
    assert!(matches!(err, Error::Device { .. }));
  }

  #[test]
  fn test_parse_line_reports_malformed_json() {
    let err = parse_line("{\"title\": ", TraceId::new()).unwrap_err();
    assert!(matches!(err, Error::Parse { ref line, .. } if line == "{\"title\": "));
  }

  #[test]
  fn test_malformed_output_device_entries_are_skipped() {
    let state = parse(json!({
      "output_devices": [{"name": "Kitchen"}, {"name": "Office", "identifier": "CC"}]
    }))
    .unwrap();
    assert_eq!(state.output_devices.map(|d| d.len()), Some(1));
  }

  fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
      Just(Value::Null),
      any::<bool>().prop_map(Value::Bool),
      any::<i64>().prop_map(Value::from),
      any::<f64>()
        .prop_filter("finite", |f| f.is_finite())
        .prop_map(Value::from),
      "[a-z_ ]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 6, |inner| {
      prop_oneof![
        prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
        prop::collection::hash_map("[a-z_]{1,8}", inner, 0..4)
          .prop_map(|m| Value::Object(m.into_iter().collect())),
      ]
    })
  }

  const FIELDS: &[&str] = &[
    "datetime",
    "hash",
    "media_type",
    "device_state",
    "title",
    "artist",
    "album",
    "genre",
    "total_time",
    "position",
    "shuffle",
    "repeat",
    "app",
    "app_id",
    "power_state",
    "volume",
    "focus_state",
    "output_devices",
  ];

  proptest! {
    #[test]
    fn prop_records_without_exception_always_parse(
      values in prop::collection::vec(arb_json(), FIELDS.len())
    ) {
      let record: Map<String, Value> = FIELDS
        .iter()
        .map(|f| f.to_string())
        .zip(values)
        .collect();
      prop_assert!(parse_state(Some(&Value::Object(record)), TraceId::new()).is_ok());
    }

    #[test]
    fn prop_exception_always_fails(message in "[a-z0-9: ]{1,32}") {
      let record = json!({"title": "x", "exception": message.clone()});
      let err = parse_state(Some(&record), TraceId::new()).unwrap_err();
      prop_assert!(err.to_string().contains(&message));
    }
  }
}
