//! Capabilities backed by external Python tooling: ruff for lint and format,
//! bandit for code audit and safety for dependency audit.

use std::{io::Write as _, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command};

use super::{Formatter, Linter, SecurityAuditor, SecurityFinding, Severity};
use crate::{Error, Result};

const TOOL_TIMEOUT: Duration = Duration::from_secs(60);
const STDIN_FILENAME: &str = "snippet.py";

/// Where to find each tool. Bare names are looked up on `PATH`.
#[derive(Debug, Clone)]
pub struct ToolPaths {
  pub ruff:   PathBuf,
  pub bandit: PathBuf,
  pub safety: PathBuf,
}

impl Default for ToolPaths {
  fn default() -> Self {
    Self {
      ruff:   PathBuf::from("ruff"),
      bandit: PathBuf::from("bandit"),
      safety: PathBuf::from("safety"),
    }
  }
}

struct ToolOutput {
  success: bool,
  code:    Option<i32>,
  stdout:  String,
  stderr:  String,
}

async fn run_tool(program: &PathBuf, args: &[&str], stdin: Option<&str>) -> Result<ToolOutput> {
  let tool = program.display().to_string();
  let mut child = Command::new(program)
    .args(args)
    .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .map_err(|source| Error::ToolUnavailable { tool: tool.clone(), source })?;

  if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
    pipe.write_all(input.as_bytes()).await?;
    drop(pipe);
  }

  let output = tokio::time::timeout(TOOL_TIMEOUT, child.wait_with_output())
    .await
    .map_err(|_| Error::ToolTimeout(tool))??;

  Ok(ToolOutput {
    success: output.status.success(),
    code:    output.status.code(),
    stdout:  String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr:  String::from_utf8_lossy(&output.stderr).into_owned(),
  })
}

fn unusable(program: &PathBuf, detail: impl Into<String>) -> Error {
  Error::ToolOutput { tool: program.display().to_string(), detail: detail.into() }
}

// ─── Ruff ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RuffLocation {
  row: u32,
}

#[derive(Deserialize)]
struct RuffDiagnostic {
  code:     Option<String>,
  message:  String,
  location: Option<RuffLocation>,
}

pub struct RuffLinter {
  program: PathBuf,
}

impl RuffLinter {
  pub fn new(program: PathBuf) -> Self { Self { program } }
}

#[async_trait]
impl Linter for RuffLinter {
  async fn lint(&self, code: &str) -> Result<Vec<String>> {
    let out = run_tool(
      &self.program,
      &["check", "-", "--output-format=json", "--stdin-filename", STDIN_FILENAME],
      Some(code),
    )
    .await?;

    if out.success {
      return Ok(Vec::new());
    }
    if out.stdout.trim().is_empty() {
      return Err(unusable(&self.program, out.stderr.trim()));
    }

    let diagnostics: Vec<RuffDiagnostic> = serde_json::from_str(&out.stdout)?;
    Ok(
      diagnostics
        .into_iter()
        .map(|d| {
          let row = d.location.map_or_else(|| "?".to_owned(), |l| l.row.to_string());
          let code = d.code.unwrap_or_else(|| "UNKNOWN".to_owned());
          format!("Line {row} [{code}]: {}", d.message)
        })
        .collect(),
    )
  }
}

pub struct RuffFormatter {
  program: PathBuf,
}

impl RuffFormatter {
  pub fn new(program: PathBuf) -> Self { Self { program } }
}

#[async_trait]
impl Formatter for RuffFormatter {
  async fn is_formatted(&self, code: &str) -> Result<bool> {
    let out = run_tool(
      &self.program,
      &["format", "--check", "-", "--stdin-filename", STDIN_FILENAME],
      Some(code),
    )
    .await?;
    // ruff exits 1 when the input would be reformatted and 2 on its own errors.
    match out.code {
      Some(0) => Ok(true),
      Some(1) => Ok(false),
      _ => Err(unusable(&self.program, out.stderr.trim())),
    }
  }
}

// ─── Bandit / safety ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct BanditReport {
  #[serde(default)]
  results: Vec<BanditResult>,
}

#[derive(Deserialize)]
struct BanditResult {
  issue_severity: String,
  issue_text:     String,
  line_number:    Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SafetyReport {
  Legacy(Vec<serde_json::Value>),
  Structured {
    #[serde(default)]
    vulnerabilities: Vec<serde_json::Value>,
  },
}

fn describe_vulnerability(v: &serde_json::Value) -> String {
  let field = |key: &str, index: usize| -> String {
    let value = if v.is_array() { v.get(index) } else { v.get(key) };
    match value {
      Some(serde_json::Value::String(s)) => s.clone(),
      Some(other) if !other.is_null() => other.to_string(),
      _ => "unknown".to_owned(),
    }
  };
  format!(
    "Dependency [{}] (ID: {}): {}",
    field("package_name", 0),
    field("vulnerability_id", 4),
    field("advisory", 3),
  )
}

pub struct BanditAuditor {
  bandit: PathBuf,
  safety: PathBuf,
}

impl BanditAuditor {
  pub fn new(bandit: PathBuf, safety: PathBuf) -> Self { Self { bandit, safety } }
}

#[async_trait]
impl SecurityAuditor for BanditAuditor {
  async fn audit_code(&self, code: &str) -> Result<Vec<SecurityFinding>> {
    let mut file = tempfile::Builder::new().suffix(".py").tempfile()?;
    file.write_all(code.as_bytes())?;
    file.flush()?;
    let path = file.path().display().to_string();

    let out = run_tool(&self.bandit, &["-f", "json", "-q", &path], None).await?;
    if out.stdout.trim().is_empty() {
      return if out.success {
        Ok(Vec::new())
      } else {
        Err(unusable(&self.bandit, out.stderr.trim()))
      };
    }

    let report: BanditReport = serde_json::from_str(&out.stdout)?;
    Ok(
      report
        .results
        .into_iter()
        .map(|r| SecurityFinding {
          severity: match r.issue_severity.to_ascii_uppercase().as_str() {
            "HIGH" => Severity::High,
            "MEDIUM" => Severity::Medium,
            _ => Severity::Low,
          },
          line:     r.line_number,
          message:  r.issue_text,
        })
        .collect(),
    )
  }

  async fn audit_dependencies(&self, dependencies: &[String]) -> Result<Vec<String>> {
    if dependencies.is_empty() {
      return Ok(Vec::new());
    }
    let mut file = tempfile::Builder::new().suffix(".txt").tempfile()?;
    for dep in dependencies {
      writeln!(file, "{dep}")?;
    }
    file.flush()?;
    let path = file.path().display().to_string();

    let out = run_tool(&self.safety, &["check", "-r", &path, "--json"], None).await?;
    if out.stdout.trim().is_empty() {
      return Err(unusable(&self.safety, out.stderr.trim()));
    }

    let vulns = match serde_json::from_str::<SafetyReport>(&out.stdout)? {
      SafetyReport::Legacy(list) => list,
      SafetyReport::Structured { vulnerabilities } => vulnerabilities,
    };
    Ok(vulns.iter().map(describe_vulnerability).collect())
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn vulnerability_formats() {
    let structured = json!({
      "package_name": "requests",
      "vulnerability_id": "58755",
      "advisory": "Leaks proxy credentials",
    });
    assert_eq!(
      describe_vulnerability(&structured),
      "Dependency [requests] (ID: 58755): Leaks proxy credentials"
    );

    let legacy = json!(["flask", "<2.2.5", "2.0.0", "Cookie leak", 12345]);
    assert_eq!(
      describe_vulnerability(&legacy),
      "Dependency [flask] (ID: 12345): Cookie leak"
    );
  }

  #[tokio::test]
  async fn missing_tool_is_unavailable() {
    let linter = RuffLinter::new(PathBuf::from("fstore-no-such-ruff-binary"));
    let err = linter.lint("x = 1\n").await.unwrap_err();
    assert!(matches!(err, Error::ToolUnavailable { .. }));
  }
}
