//! Out-of-process test execution.
//!
//! The candidate code never runs in this process. A harness script is written
//! to a scratch directory next to a JSON payload and run by the runtime's
//! interpreter; its last stdout line is the result.

use std::{process::Stdio, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use fstore_core::function::TestCase;

use crate::{Error, Result, pool::Runtime};

const HARNESS: &str = include_str!("harness.py");

/// How a sandbox run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
  Passed,
  /// The code failed to load, or no entry point could be found.
  Setup,
  /// At least one test raised or returned the wrong value.
  Failed,
  Timeout,
  /// The interpreter exited abnormally or printed no result.
  Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
  pub outcome:    Outcome,
  /// Empty when the run passed.
  pub diagnostic: String,
}

impl Verdict {
  fn new(outcome: Outcome, diagnostic: impl Into<String>) -> Self {
    Self { outcome, diagnostic: diagnostic.into() }
  }

  pub fn passed(&self) -> bool { self.outcome == Outcome::Passed }
}

#[derive(Deserialize)]
struct HarnessReport {
  status: String,
  #[serde(default)]
  error:  String,
}

pub struct SandboxRunner {
  timeout: Duration,
}

impl SandboxRunner {
  pub fn new(timeout: Duration) -> Self { Self { timeout } }

  /// Run `test_cases` against `code` with `runtime`'s interpreter.
  ///
  /// Never fails: every problem, including a hung child, comes back as a
  /// non-passing [`Verdict`]. A timed-out child is killed.
  pub async fn run(
    &self,
    code: &str,
    test_cases: &[TestCase],
    entry_point: Option<&str>,
    runtime: &Runtime,
  ) -> Verdict {
    match self.try_run(code, test_cases, entry_point, runtime).await {
      Ok(verdict) => verdict,
      Err(err @ Error::SandboxTimeout(_)) => Verdict::new(Outcome::Timeout, err.to_string()),
      Err(err) => Verdict::new(Outcome::Crashed, format!("Runtime Exception: {err}")),
    }
  }

  async fn try_run(
    &self,
    code: &str,
    test_cases: &[TestCase],
    entry_point: Option<&str>,
    runtime: &Runtime,
  ) -> Result<Verdict> {
    let scratch = tempfile::tempdir()?;
    let harness = scratch.path().join("harness.py");
    let payload = scratch.path().join("payload.json");
    tokio::fs::write(&harness, HARNESS).await?;
    tokio::fs::write(
      &payload,
      serde_json::to_vec(&json!({
        "code": code,
        "test_cases": test_cases,
        "entry_point": entry_point,
      }))?,
    )
    .await?;

    let child = Command::new(&runtime.python)
      .arg(&harness)
      .arg(&payload)
      .current_dir(scratch.path())
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;

    // Dropping the child on timeout kills it.
    let output = tokio::time::timeout(self.timeout, child.wait_with_output())
      .await
      .map_err(|_| Error::SandboxTimeout(self.timeout))??;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(status = %output.status, stdout_len = stdout.len(), "sandbox child exited");

    if !output.status.success() {
      let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
      let code = output.status.code().map_or_else(|| "signal".to_owned(), |c| c.to_string());
      return Ok(Verdict::new(
        Outcome::Crashed,
        format!("Execution Error (Code {code}):\n{detail}"),
      ));
    }

    let last = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let Ok(report) = serde_json::from_str::<HarnessReport>(last) else {
      return Ok(Verdict::new(Outcome::Crashed, format!("Invalid runner output: {stdout}")));
    };

    Ok(match report.status.as_str() {
      "success" => Verdict::new(Outcome::Passed, ""),
      "setup_error" => Verdict::new(Outcome::Setup, report.error),
      _ => Verdict::new(Outcome::Failed, report.error),
    })
  }
}

#[cfg(test)]
mod tests {
  use std::{path::PathBuf, time::Instant};

  use super::*;

  /// `python3` if it is on PATH; tests that need it return early otherwise.
  fn host_python() -> Option<Runtime> {
    let ok = std::process::Command::new("python3")
      .arg("--version")
      .output()
      .is_ok_and(|o| o.status.success());
    ok.then(|| Runtime { python: PathBuf::from("python3"), key: None })
  }

  fn case(input: serde_json::Value, expected: serde_json::Value) -> TestCase {
    let serde_json::Value::Object(input) = input else { panic!("input must be an object") };
    TestCase { input, expected }
  }

  fn runner() -> SandboxRunner { SandboxRunner::new(Duration::from_secs(20)) }

  #[tokio::test]
  async fn passing_function_verifies() {
    let Some(rt) = host_python() else { return };
    let code = "def add(a, b):\n    return a + b\n";
    let verdict = runner()
      .run(code, &[case(json!({"a": 1, "b": 2}), json!(3))], None, &rt)
      .await;
    assert!(verdict.passed(), "{verdict:?}");
  }

  #[tokio::test]
  async fn wrong_result_is_a_test_failure() {
    let Some(rt) = host_python() else { return };
    let code = "def add(a, b):\n    return a - b\n";
    let verdict = runner()
      .run(code, &[case(json!({"a": 1, "b": 2}), json!(3))], None, &rt)
      .await;
    assert_eq!(verdict.outcome, Outcome::Failed);
    assert!(verdict.diagnostic.contains("Test 1: Expected 3, got -1"));
  }

  #[tokio::test]
  async fn load_error_is_setup_failure() {
    let Some(rt) = host_python() else { return };
    let code = "raise RuntimeError('boom')\ndef f():\n    return 1\n";
    let verdict = runner().run(code, &[], None, &rt).await;
    assert_eq!(verdict.outcome, Outcome::Setup);
    assert!(verdict.diagnostic.contains("boom"));
  }

  #[tokio::test]
  async fn explicit_entry_point_wins_over_last_definition() {
    let Some(rt) = host_python() else { return };
    let code = "def double(x):\n    return x * 2\n\ndef helper(x):\n    return x\n";
    let tests = [case(json!({"x": 4}), json!(8))];

    let implicit = runner().run(code, &tests, None, &rt).await;
    assert_eq!(implicit.outcome, Outcome::Failed);

    let explicit = runner().run(code, &tests, Some("double"), &rt).await;
    assert!(explicit.passed(), "{explicit:?}");

    let missing = runner().run(code, &tests, Some("nope"), &rt).await;
    assert_eq!(missing.outcome, Outcome::Setup);
  }

  #[tokio::test]
  async fn imported_callables_are_not_candidates() {
    let Some(rt) = host_python() else { return };
    let code = "def root(x):\n    return sqrt(x)\n\nfrom math import sqrt\n";
    let verdict = runner()
      .run(code, &[case(json!({"x": 9}), json!(3.0))], None, &rt)
      .await;
    assert!(verdict.passed(), "{verdict:?}");
  }

  #[tokio::test]
  async fn explicit_entry_point_must_be_defined_by_the_code() {
    let Some(rt) = host_python() else { return };
    let code = "from math import sqrt\n\ndef root(x):\n    return sqrt(x)\n";
    let tests = [case(json!({"x": 9}), json!(3.0))];

    let imported = runner().run(code, &tests, Some("sqrt"), &rt).await;
    assert_eq!(imported.outcome, Outcome::Setup);
    assert!(imported.diagnostic.contains("'sqrt' is not a callable defined by the code"));

    let own = runner().run(code, &tests, Some("root"), &rt).await;
    assert!(own.passed(), "{own:?}");
  }

  #[tokio::test]
  async fn tuples_compare_equal_to_json_lists() {
    let Some(rt) = host_python() else { return };
    let code = "def pair(a):\n    return (a, a)\n";
    let verdict = runner().run(code, &[case(json!({"a": 1}), json!([1, 1]))], None, &rt).await;
    assert!(verdict.passed(), "{verdict:?}");
  }

  #[tokio::test]
  async fn hung_function_is_killed() {
    let Some(rt) = host_python() else { return };
    let code = "def spin():\n    while True:\n        pass\n";
    let start = Instant::now();
    let verdict = SandboxRunner::new(Duration::from_secs(1))
      .run(code, &[case(json!({}), json!(null))], None, &rt)
      .await;
    assert_eq!(verdict.outcome, Outcome::Timeout);
    assert!(start.elapsed() < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn missing_interpreter_is_reported() {
    let rt = Runtime { python: PathBuf::from("fstore-no-such-python"), key: None };
    let verdict = runner().run("def f():\n    return 1\n", &[], None, &rt).await;
    assert_eq!(verdict.outcome, Outcome::Crashed);
    assert!(!verdict.passed());
  }
}
