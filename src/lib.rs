//! Typed, event-driven client for Apple TVs, backed by pyatv's `atvscript`.
//!
//! ```no_run
//! use atv_remote::{Device, DeviceOptions, EventName};
//!
//! # async fn demo() -> atv_remote::Result<()> {
//! let device = Device::new(DeviceOptions::new("192.168.178.20"))?;
//! device.on(EventName::Update, |event| {
//!   if let Some(change) = event.as_update() {
//!     println!("{} changed to {:?}", change.key, change.new_value);
//!   }
//!   Ok(())
//! });
//! device.play_pause().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod script;

pub use config::{DeviceOptions, ListenerTimings};
pub use device::{
  ChangeEvent, Device, DeviceEvents, DeviceRef, DeviceState, Error, Event, EventName, FocusState,
  ListenerError, ListenerId, ListenerState, MediaType, OutputDevice, PowerState, RepeatState,
  Result, ShuffleState, StateKey, StateSnapshot, StateValue,
};
pub use script::{Key, ProcessRunner, TokioProcessRunner};
