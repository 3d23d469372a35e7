//! One-shot atvscript requests: run to completion, collect the output.

use super::process::{ProcessError, ProcessEvent, ProcessRunner};
use super::protocol::{ScriptCommand, TraceId};

/// Everything a finished process produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOutput {
  pub stdout: String,
  pub stderr: String,
  pub code: Option<i32>,
}

/// Run `command` until it exits.
///
/// Process-level errors reported while running fail the request, a non-zero
/// exit code does not (callers decide what the output means).
pub async fn run_request(
  runner: &dyn ProcessRunner,
  command: &ScriptCommand,
  trace: TraceId,
) -> Result<RequestOutput, ProcessError> {
  log::debug!("[{}] request: {} {:?}", trace, command.program, command.args);
  let spawned = runner.spawn(&command.program, &command.args)?;

  let mut stdout = Vec::new();
  let mut stderr = Vec::new();
  let mut failure = None;

  let code = loop {
    match spawned.events.recv().await {
      Ok(ProcessEvent::Stdout(chunk)) => stdout.extend_from_slice(&chunk),
      Ok(ProcessEvent::Stderr(line)) => stderr.push(line),
      Ok(ProcessEvent::Error(e)) => {
        log::warn!("[{}] request error: {}", trace, e);
        failure.get_or_insert(e);
      }
      Ok(ProcessEvent::Exit(code)) => break code,
      Err(_) => break None,
    }
  };

  if let Some(e) = failure {
    return Err(ProcessError::Io(e));
  }

  let output = RequestOutput {
    stdout: String::from_utf8_lossy(&stdout).into_owned(),
    stderr: stderr.join("\n"),
    code,
  };
  log::debug!("[{}] request finished with code {:?}", trace, output.code);
  Ok(output)
}

/// Run `command` and decode its stdout as one JSON object.
pub async fn request_json(
  runner: &dyn ProcessRunner,
  command: &ScriptCommand,
  trace: TraceId,
) -> Result<serde_json::Value, ProcessError> {
  let output = run_request(runner, command, trace).await?;

  if !output.stderr.is_empty() && output.stdout.trim().is_empty() {
    return Err(ProcessError::Failed {
      code: output.code,
      stderr: output.stderr,
    });
  }

  let value: serde_json::Value = serde_json::from_str(output.stdout.trim()).map_err(|e| {
    ProcessError::InvalidOutput(format!("{}: {}", e, output.stdout.trim()))
  })?;
  if !value.is_object() {
    return Err(ProcessError::InvalidOutput(output.stdout));
  }
  log::debug!("[{}] response: {}", trace, value);
  Ok(value)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::DeviceOptions;
  use crate::script::fake::{FakeProcessRunner, FakeScript};

  fn command() -> ScriptCommand {
    let mut options = DeviceOptions::new("10.0.0.5");
    options.atvscript_path = Some("atvscript".to_string());
    ScriptCommand::playing(&options)
  }

  #[tokio::test]
  async fn test_request_json_decodes_stdout() {
    let runner = FakeProcessRunner::new();
    runner.enqueue(FakeScript::stdout(r#"{"result":"success","title":"Foo"}"#).exit(0));

    let value = request_json(&runner, &command(), TraceId::new()).await.unwrap();
    assert_eq!(value["title"], "Foo");
    assert_eq!(runner.spawns()[0].args.last().map(String::as_str), Some("playing"));
  }

  #[tokio::test]
  async fn test_request_json_stderr_only_fails() {
    let runner = FakeProcessRunner::new();
    runner.enqueue(FakeScript::default().stderr_line("boom").exit(1));

    let err = request_json(&runner, &command(), TraceId::new()).await.unwrap_err();
    assert!(matches!(err, ProcessError::Failed { code: Some(1), .. }));
  }

  #[tokio::test]
  async fn test_request_json_rejects_non_object() {
    let runner = FakeProcessRunner::new();
    runner.enqueue(FakeScript::stdout("[1,2]").exit(0));

    let err = request_json(&runner, &command(), TraceId::new()).await.unwrap_err();
    assert!(matches!(err, ProcessError::InvalidOutput(_)));
  }

  #[tokio::test]
  async fn test_run_request_reports_process_error() {
    let runner = FakeProcessRunner::new();
    runner.enqueue(FakeScript::default().error("pipe closed").exit(1));

    let err = run_request(&runner, &command(), TraceId::new()).await.unwrap_err();
    assert!(matches!(err, ProcessError::Io(msg) if msg == "pipe closed"));
  }
}
