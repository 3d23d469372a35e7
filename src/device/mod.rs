//! Device module - state, change events and the push update subscription.
//!
//! Architecture:
//! - `types.rs` - state snapshot, attribute enums and event payloads
//! - `state.rs` - tolerant parsing of atvscript JSON records
//! - `events.rs` - listener registry driving the push update subprocess
//! - `client.rs` - high-level device client with getters and key presses

mod client;
mod error;
mod events;
mod state;
mod types;

pub use client::Device;
pub use error::{Error, ListenerError, Result};
pub use events::{DeviceEvents, Listener, ListenerId};
pub use state::{parse_line, parse_state};
pub use types::*;
