//! The synchronous security gate run on every submission before anything is
//! persisted.
//!
//! Two independent checks: a credential regex scan over the raw text and a
//! call denylist over the syntax tree. The secret scan runs first and on
//! every input, including code that does not parse.

use std::sync::LazyLock;

use regex::Regex;
use rustpython_parser::ast::Expr;

use fstore_core::Rejection;

use crate::python::{self, Node};

/// A pure, side-effect free check of one source dialect.
pub trait StaticAnalyzer: Send + Sync {
  /// `Ok(())` when the code may be stored.
  fn scan(&self, code: &str) -> Result<(), Rejection>;
}

// ─── Secret patterns ─────────────────────────────────────────────────────────

struct SecretPattern {
  kind:  &'static str,
  regex: Regex,
}

static SECRET_PATTERNS: LazyLock<Vec<SecretPattern>> = LazyLock::new(|| {
  [
    ("Google API Key", r"AIza[0-9A-Za-z_\-]{35}"),
    ("GitHub Token", r"ghp_[a-zA-Z0-9]{36}"),
    ("GitHub Fine-Grained Token", r"github_pat_[a-zA-Z0-9_]{82}"),
    ("GitLab Token", r"glpat-[0-9A-Za-z_\-]{20}"),
    ("AWS Access Key", r"AKIA[0-9A-Z]{16}"),
    ("Slack Token", r"xox[baprs]-[0-9A-Za-z\-]{10,}"),
  ]
  .into_iter()
  .map(|(kind, pattern)| SecretPattern {
    kind,
    regex: Regex::new(pattern).expect("secret patterns are valid"),
  })
  .collect()
});

/// The credential kind found in `code`, if any.
pub fn find_secret(code: &str) -> Option<&'static str> {
  SECRET_PATTERNS
    .iter()
    .find(|p| p.regex.is_match(code))
    .map(|p| p.kind)
}

// ─── Call denylist ───────────────────────────────────────────────────────────

/// `(module, attribute)` pairs that may not be called.
const DENIED_ATTRIBUTE_CALLS: &[(&str, &[&str])] = &[
  ("os", &[
    "fork", "kill", "setuid", "setgid", "chroot", "system", "popen", "execv",
    "execve",
  ]),
  ("pty", &["spawn"]),
  ("subprocess", &[
    "run",
    "Popen",
    "call",
    "check_call",
    "check_output",
  ]),
  ("builtins", &["eval", "exec"]),
];

/// Bare names that may not be called.
const DENIED_BARE_CALLS: &[&str] = &["eval", "exec", "system", "fork", "__import__"];

fn denied_call(func: &Expr) -> Option<String> {
  let name = python::dotted_name(func)?;
  match name.split_once('.') {
    None => DENIED_BARE_CALLS.contains(&name.as_str()).then_some(name),
    Some((module, attr)) => DENIED_ATTRIBUTE_CALLS
      .iter()
      .any(|(m, attrs)| *m == module && attrs.contains(&attr))
      .then_some(name),
  }
}

// ─── PythonGate ──────────────────────────────────────────────────────────────

/// [`StaticAnalyzer`] for Python source.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonGate;

impl StaticAnalyzer for PythonGate {
  fn scan(&self, code: &str) -> Result<(), Rejection> {
    if let Some(kind) = find_secret(code) {
      return Err(Rejection::Secret { kind: kind.to_owned() });
    }

    let body = python::parse_module(code)?;

    let mut blocked = None;
    python::walk(&body, &mut |node| {
      if blocked.is_some() {
        return;
      }
      if let Node::Expr(Expr::Call(call)) = node {
        blocked = denied_call(&call.func);
      }
    });

    match blocked {
      Some(call) => Err(Rejection::Security { call }),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scan(code: &str) -> Result<(), Rejection> { PythonGate.scan(code) }

  #[test]
  fn clean_code_passes() {
    assert_eq!(scan("def add(a, b):\n    return a + b\n"), Ok(()));
  }

  #[test]
  fn os_system_is_blocked() {
    let err = scan("import os\ndef f(): os.system('x')").unwrap_err();
    assert_eq!(err, Rejection::Security { call: "os.system".into() });
    assert!(err.to_string().contains("os.system"));
  }

  #[test]
  fn nested_and_bare_calls_are_blocked() {
    let err = scan("def f(x):\n    if x:\n        return [eval(v) for v in x]\n")
      .unwrap_err();
    assert_eq!(err, Rejection::Security { call: "eval".into() });

    let err = scan("import subprocess\nsubprocess.Popen(['ls'])\n").unwrap_err();
    assert_eq!(err, Rejection::Security { call: "subprocess.Popen".into() });
  }

  #[test]
  fn unrelated_attribute_named_like_denylist_passes() {
    assert_eq!(scan("import re\nre.compile('x').search('y')\n"), Ok(()));
    assert_eq!(scan("import os\nos.path.join('a', 'b')\n"), Ok(()));
  }

  #[test]
  fn syntax_error_is_rejected() {
    let err = scan("def f(:\n  pass").unwrap_err();
    assert!(matches!(err, Rejection::Syntax { line: 1, .. }));
    assert!(err.to_string().starts_with("Syntax Error"));
  }

  #[test]
  fn every_secret_pattern_is_loaded() {
    assert_eq!(SECRET_PATTERNS.len(), 6);
  }

  #[test]
  fn secret_is_rejected_in_valid_code() {
    let code = format!("KEY = 'AIza{}'\ndef f():\n    return KEY\n", "a".repeat(35));
    let err = scan(&code).unwrap_err();
    assert_eq!(err, Rejection::Secret { kind: "Google API Key".into() });
  }

  #[test]
  fn secret_wins_over_syntax_error() {
    let code = format!("token = 'ghp_{}'\ndef broken(:\n", "A".repeat(36));
    let err = scan(&code).unwrap_err();
    assert!(matches!(err, Rejection::Secret { .. }));
  }
}
