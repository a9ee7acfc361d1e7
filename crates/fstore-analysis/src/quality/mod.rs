//! Quality scoring and the description heal loop.
//!
//! Every stage is an optional capability. A stage that is not configured, or
//! whose tool fails to run, is skipped without penalty.

mod tools;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fstore_core::{
  capability::{Descriptions, Reviewer},
  function::ReliabilityTier,
};

pub use self::tools::{BanditAuditor, RuffFormatter, RuffLinter, ToolPaths};
use crate::Result;

// ─── Capabilities ────────────────────────────────────────────────────────────

#[async_trait]
pub trait Linter: Send + Sync {
  /// One human-readable message per lint error. Empty means clean.
  async fn lint(&self, code: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Formatter: Send + Sync {
  async fn is_formatted(&self, code: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
  Low,
  Medium,
  High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFinding {
  pub severity: Severity,
  pub line:     Option<u32>,
  pub message:  String,
}

#[async_trait]
pub trait SecurityAuditor: Send + Sync {
  async fn audit_code(&self, code: &str) -> Result<Vec<SecurityFinding>>;

  /// One message per known-vulnerable dependency.
  async fn audit_dependencies(&self, dependencies: &[String]) -> Result<Vec<String>>;
}

// ─── Weights ─────────────────────────────────────────────────────────────────

/// Penalty constants. Defaults reproduce the historical scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
  /// Lint penalty per error per line.
  pub lint_density_factor:   f64,
  pub lint_cap:              f64,
  pub formatter_penalty:     f64,
  pub high_severity:         f64,
  pub medium_severity:       f64,
  pub low_severity:          f64,
  pub code_audit_cap:        f64,
  pub vulnerable_dependency: f64,
  pub dependency_audit_cap:  f64,
  /// Applied when the reviewer rejects the code.
  pub review_penalty:        f64,
  /// Minimum description score accepted by the heal loop.
  pub description_threshold: u8,
}

impl Default for QualityWeights {
  fn default() -> Self {
    Self {
      lint_density_factor:   500.0,
      lint_cap:              70.0,
      formatter_penalty:     30.0,
      high_severity:         40.0,
      medium_severity:       20.0,
      low_severity:          5.0,
      code_audit_cap:        80.0,
      vulnerable_dependency: 30.0,
      dependency_audit_cap:  90.0,
      review_penalty:        40.0,
      description_threshold: 60,
    }
  }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
  Passed,
  Failed,
  Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
  pub status:   StageStatus,
  pub penalty:  f64,
  pub findings: Vec<String>,
}

impl StageReport {
  fn skipped() -> Self {
    Self { status: StageStatus::Skipped, penalty: 0.0, findings: Vec::new() }
  }

  fn judged(penalty: f64, findings: Vec<String>) -> Self {
    let status = if findings.is_empty() { StageStatus::Passed } else { StageStatus::Failed };
    Self { status, penalty, findings }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
  pub final_score:  u8,
  pub reliability:  ReliabilityTier,
  pub linter:       StageReport,
  pub formatter:    StageReport,
  pub code_audit:   StageReport,
  pub dependencies: StageReport,
  pub review:       StageReport,
}

impl QualityReport {
  /// One-paragraph summary stored as the function's quality feedback.
  pub fn feedback(&self) -> String {
    let stages = [
      ("lint", &self.linter),
      ("format", &self.formatter),
      ("security", &self.code_audit),
      ("dependencies", &self.dependencies),
      ("review", &self.review),
    ];
    let mut parts = vec![format!("Score {}/100 ({})", self.final_score, self.reliability)];
    for (label, stage) in stages {
      match stage.status {
        StageStatus::Passed => {}
        StageStatus::Skipped => parts.push(format!("{label}: skipped")),
        StageStatus::Failed => {
          let first = stage.findings.first().map(String::as_str).unwrap_or("failed");
          parts.push(format!("{label}: -{:.0} ({first})", stage.penalty));
        }
      }
    }
    parts.join("; ")
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealStatus {
  Passed,
  FailedCode,
  FailedDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealReport {
  pub status:          HealStatus,
  /// Description score of `descriptions`; `None` when no review ran.
  pub score:           Option<u8>,
  /// The accepted descriptions, or the best attempt on failure.
  pub descriptions:    Descriptions,
  /// Description score of the submitted descriptions.
  pub submitted_score: Option<u8>,
  /// Number of regenerations performed.
  pub attempts:        u32,
  pub feedback:        String,
}

impl HealReport {
  fn code_failure(descriptions: Descriptions, feedback: String) -> Self {
    Self {
      status: HealStatus::FailedCode,
      score: None,
      descriptions,
      submitted_score: None,
      attempts: 0,
      feedback,
    }
  }

  /// Whether `descriptions` were accepted after at least one regeneration.
  pub fn healed(&self) -> bool { self.attempts > 0 && self.status == HealStatus::Passed }

  /// Whether `descriptions` scored higher than the submitted ones, accepted
  /// or not.
  pub fn improved(&self) -> bool {
    match (self.score, self.submitted_score) {
      (Some(best), Some(submitted)) => best > submitted,
      _ => false,
    }
  }
}

// ─── QualityGate ─────────────────────────────────────────────────────────────

/// Composes the configured capabilities into a score.
#[derive(Clone, Default)]
pub struct QualityGate {
  linter:    Option<Arc<dyn Linter>>,
  formatter: Option<Arc<dyn Formatter>>,
  auditor:   Option<Arc<dyn SecurityAuditor>>,
  reviewer:  Option<Arc<dyn Reviewer>>,
  weights:   QualityWeights,
}

impl QualityGate {
  pub fn new(weights: QualityWeights) -> Self { Self { weights, ..Self::default() } }

  /// A gate backed by ruff and bandit/safety at the given paths.
  pub fn with_tools(weights: QualityWeights, tools: ToolPaths) -> Self {
    Self::new(weights)
      .with_linter(Arc::new(RuffLinter::new(tools.ruff.clone())))
      .with_formatter(Arc::new(RuffFormatter::new(tools.ruff)))
      .with_auditor(Arc::new(BanditAuditor::new(tools.bandit, tools.safety)))
  }

  pub fn with_linter(mut self, linter: Arc<dyn Linter>) -> Self {
    self.linter = Some(linter);
    self
  }

  pub fn with_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
    self.formatter = Some(formatter);
    self
  }

  pub fn with_auditor(mut self, auditor: Arc<dyn SecurityAuditor>) -> Self {
    self.auditor = Some(auditor);
    self
  }

  pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
    self.reviewer = Some(reviewer);
    self
  }

  pub fn reviewer(&self) -> Option<&Arc<dyn Reviewer>> { self.reviewer.as_ref() }

  pub fn weights(&self) -> &QualityWeights { &self.weights }

  /// Run every configured stage and combine the penalties.
  pub async fn score(
    &self,
    name: &str,
    code: &str,
    description: &str,
    dependencies: &[String],
  ) -> QualityReport {
    let w = &self.weights;

    let linter = match &self.linter {
      None => StageReport::skipped(),
      Some(linter) => match linter.lint(code).await {
        Ok(errors) => {
          let lines = (code.matches('\n').count() + 1) as f64;
          let penalty = (errors.len() as f64 / lines * w.lint_density_factor).min(w.lint_cap);
          StageReport::judged(penalty, errors)
        }
        Err(err) => skip("linter", name, err),
      },
    };

    let formatter = match &self.formatter {
      None => StageReport::skipped(),
      Some(formatter) => match formatter.is_formatted(code).await {
        Ok(true) => StageReport::judged(0.0, Vec::new()),
        Ok(false) => StageReport::judged(w.formatter_penalty, vec![
          "code is not formatted".to_owned(),
        ]),
        Err(err) => skip("formatter", name, err),
      },
    };

    let (code_audit, dependencies) = match &self.auditor {
      None => (StageReport::skipped(), StageReport::skipped()),
      Some(auditor) => {
        let code_audit = match auditor.audit_code(code).await {
          Ok(findings) => {
            let penalty: f64 = findings
              .iter()
              .map(|f| match f.severity {
                Severity::High => w.high_severity,
                Severity::Medium => w.medium_severity,
                Severity::Low => w.low_severity,
              })
              .sum();
            let messages = findings
              .iter()
              .map(|f| match f.line {
                Some(line) => format!("line {line}: {}", f.message),
                None => f.message.clone(),
              })
              .collect();
            StageReport::judged(penalty.min(w.code_audit_cap), messages)
          }
          Err(err) => skip("security audit", name, err),
        };
        let dependencies = if dependencies.is_empty() {
          StageReport::judged(0.0, Vec::new())
        } else {
          match auditor.audit_dependencies(dependencies).await {
            Ok(vulns) => {
              let penalty =
                (vulns.len() as f64 * w.vulnerable_dependency).min(w.dependency_audit_cap);
              StageReport::judged(penalty, vulns)
            }
            Err(err) => skip("dependency audit", name, err),
          }
        };
        (code_audit, dependencies)
      }
    };

    let review = match &self.reviewer {
      None => StageReport::skipped(),
      Some(reviewer) => match reviewer.review_code(code).await {
        Ok(review) if review.passed => {
          // Description wording is reported but never penalised here; the
          // heal loop owns description quality.
          let descriptions = Descriptions { en: description.to_owned(), jp: String::new() };
          match reviewer.review_description(name, code, &descriptions).await {
            Ok(d) if d.score < w.description_threshold => StageReport::judged(0.0, vec![
              format!("description scored {}/100: {}", d.score, d.feedback),
            ]),
            _ => StageReport::judged(0.0, Vec::new()),
          }
        }
        Ok(review) => StageReport::judged(w.review_penalty, vec![review.feedback]),
        Err(err) => {
          warn!(function = name, error = %err, "code review failed, skipping stage");
          StageReport::skipped()
        }
      },
    };

    let total = linter.penalty
      + formatter.penalty
      + code_audit.penalty
      + dependencies.penalty
      + review.penalty;
    let final_score = (100.0 - total).floor().clamp(0.0, 100.0) as u8;
    debug!(function = name, final_score, total_penalty = total, "quality scored");

    QualityReport {
      final_score,
      reliability: ReliabilityTier::from_score(final_score),
      linter,
      formatter,
      code_audit,
      dependencies,
      review,
    }
  }

  /// Check code quality, then review the description and regenerate it from
  /// the reviewer's feedback until it is accepted or `max_retries`
  /// regenerations have been spent.
  ///
  /// Code problems are never healed. Lint errors, a high-severity security
  /// finding or a rejected code review return [`HealStatus::FailedCode`]
  /// straight away.
  pub async fn check_with_heal(
    &self,
    name: &str,
    code: &str,
    descriptions: Descriptions,
    max_retries: u32,
  ) -> fstore_core::Result<HealReport> {
    if let Some(linter) = &self.linter {
      match linter.lint(code).await {
        Ok(errors) if !errors.is_empty() => {
          let feedback = format!("Linter errors: {}", errors.join("; "));
          return Ok(HealReport::code_failure(descriptions, feedback));
        }
        Ok(_) => {}
        Err(err) => warn!(function = name, error = %err, "linter unavailable, skipping stage"),
      }
    }

    if let Some(auditor) = &self.auditor {
      match auditor.audit_code(code).await {
        Ok(findings) => {
          let high: Vec<String> = findings
            .iter()
            .filter(|f| f.severity == Severity::High)
            .map(|f| f.message.clone())
            .collect();
          if !high.is_empty() {
            let feedback = format!("Security issues: {}", high.join("; "));
            return Ok(HealReport::code_failure(descriptions, feedback));
          }
        }
        Err(err) => {
          warn!(function = name, error = %err, "security audit unavailable, skipping stage")
        }
      }
    }

    let Some(reviewer) = &self.reviewer else {
      return Ok(HealReport {
        status: HealStatus::Passed,
        score: None,
        descriptions,
        submitted_score: None,
        attempts: 0,
        feedback: "review skipped".to_owned(),
      });
    };

    let code_review = reviewer.review_code(code).await?;
    if !code_review.passed {
      return Ok(HealReport::code_failure(descriptions, code_review.feedback));
    }

    let threshold = self.weights.description_threshold;
    let mut current = descriptions;
    let mut best: Option<(u8, Descriptions, String)> = None;
    let mut submitted_score = None;
    let mut attempts = 0;

    loop {
      let review = reviewer.review_description(name, code, &current).await?;
      submitted_score.get_or_insert(review.score);
      if review.score >= threshold {
        return Ok(HealReport {
          status: HealStatus::Passed,
          score: Some(review.score),
          descriptions: current,
          submitted_score,
          attempts,
          feedback: review.feedback,
        });
      }

      let improved = best.as_ref().is_none_or(|(score, ..)| review.score > *score);
      if improved {
        best = Some((review.score, current.clone(), review.feedback.clone()));
      }

      if attempts >= max_retries {
        break;
      }
      attempts += 1;
      debug!(function = name, attempt = attempts, score = review.score, "regenerating description");
      current = reviewer.generate_description(name, code, &review.feedback).await?;
    }

    let (score, descriptions, feedback) =
      best.ok_or_else(|| fstore_core::Error::Internal("heal loop ran no reviews".into()))?;
    warn!(function = name, attempts, score, "description heal exhausted retries");
    Ok(HealReport {
      status: HealStatus::FailedDescription,
      score: Some(score),
      descriptions,
      submitted_score,
      attempts,
      feedback,
    })
  }
}

fn skip(stage: &str, name: &str, err: crate::Error) -> StageReport {
  warn!(function = name, stage, error = %err, "quality stage unavailable, skipping");
  StageReport::skipped()
}
