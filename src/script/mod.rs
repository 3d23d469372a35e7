//! atvscript subprocess layer - spawns the external tool and talks to it over stdio.
//!
//! Architecture:
//! - `process.rs` - executable detection, the `ProcessRunner` seam and the Tokio implementation
//! - `protocol.rs` - command lines, remote keys and log correlation ids
//! - `request.rs` - one-shot request/response helper
//! - `fake.rs` - deterministic runner for tests

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
mod process;
mod protocol;
mod request;

pub use process::{
  find_executable, resolve_program, ProcessError, ProcessEvent, ProcessHandle, ProcessRunner,
  SpawnedProcess, TokioProcessRunner,
};
pub use protocol::{connection_args, Key, ScriptCommand, TraceId, ATVSCRIPT};
pub use request::{request_json, run_request, RequestOutput};
