//! Function assets, the fundamental unit of the store.
//!
//! A function asset is a named, versioned code submission. The current state
//! lives in one record; every overwrite archives the previous state as an
//! immutable [`VersionSnapshot`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

// ─── Status ──────────────────────────────────────────────────────────────────

/// Lifecycle status of a function asset.
///
/// `Pending` and `Unverified` are set synchronously by a save; every other
/// status is written by the background maintenance pass.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FunctionStatus {
  Pending,
  Unverified,
  Verified,
  Failed,
  Broken,
  Deleted,
}

impl FunctionStatus {
  /// Whether maintenance has finished with this record.
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Verified | Self::Failed | Self::Broken)
  }
}

/// Coarse bucket derived from the quality score.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReliabilityTier {
  Low,
  Medium,
  High,
  #[default]
  Pending,
}

impl ReliabilityTier {
  /// ≥80 high, ≥50 medium, else low.
  pub fn from_score(score: u8) -> Self {
    match score {
      80.. => Self::High,
      50..=79 => Self::Medium,
      _ => Self::Low,
    }
  }
}

// ─── Test cases ──────────────────────────────────────────────────────────────

/// One declared test: keyword arguments for the entry point and the expected
/// return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
  #[serde(default)]
  pub input:    serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub expected: serde_json::Value,
}

// ─── Metadata ────────────────────────────────────────────────────────────────

/// Mutable bookkeeping attached to the current record of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetadata {
  pub quality_score:         u8,
  pub reliability:           ReliabilityTier,
  pub quality_feedback:      Option<String>,
  pub verification_error:    Option<String>,
  /// Dependencies the submitter declared.
  pub declared_dependencies: Vec<String>,
  /// Dependencies found by scanning imports.
  #[serde(default)]
  pub detected_dependencies: Vec<String>,
  /// Exact `name==version` pins captured from the verification environment.
  #[serde(default)]
  pub locked_dependencies:   Vec<String>,
  /// Other stored functions this code calls.
  #[serde(default)]
  pub internal_dependencies: Vec<String>,
  #[serde(default)]
  pub heal_attempts:         u32,
  pub saved_at:              DateTime<Utc>,
  pub last_verified_at:      Option<DateTime<Utc>>,
}

impl FunctionMetadata {
  pub fn new(declared_dependencies: Vec<String>, saved_at: DateTime<Utc>) -> Self {
    Self {
      quality_score: 0,
      reliability: ReliabilityTier::Pending,
      quality_feedback: Some("Pending background verification".into()),
      verification_error: None,
      declared_dependencies,
      detected_dependencies: Vec::new(),
      locked_dependencies: Vec::new(),
      internal_dependencies: Vec::new(),
      heal_attempts: 0,
      saved_at,
      last_verified_at: None,
    }
  }
}

// ─── FunctionAsset ───────────────────────────────────────────────────────────

/// The current state of a stored function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionAsset {
  pub id:             i64,
  /// Globally unique.
  pub name:           String,
  pub code:           String,
  pub description:    String,
  pub description_en: Option<String>,
  pub description_jp: Option<String>,
  pub tags:           Vec<String>,
  pub dependencies:   Vec<String>,
  pub test_cases:     Vec<TestCase>,
  /// Name of the callable the sandbox invokes; `None` means the last public
  /// top-level callable.
  pub entry_point:    Option<String>,
  pub status:         FunctionStatus,
  /// Starts at 1 and increases by exactly one per overwrite.
  pub version:        u32,
  pub metadata:       FunctionMetadata,
  pub call_count:     u64,
  pub last_called_at: Option<DateTime<Utc>>,
  pub created_at:     DateTime<Utc>,
  pub updated_at:     DateTime<Utc>,
}

impl FunctionAsset {
  /// The description used for embedding and scoring: English, then
  /// Japanese, then the plain description.
  pub fn primary_description(&self) -> &str {
    primary_description(
      &self.description,
      self.description_en.as_deref(),
      self.description_jp.as_deref(),
    )
  }
}

pub fn primary_description<'a>(
  plain: &'a str,
  en: Option<&'a str>,
  jp: Option<&'a str>,
) -> &'a str {
  en.filter(|s| !s.is_empty())
    .or(jp.filter(|s| !s.is_empty()))
    .unwrap_or(plain)
}

/// Immutable copy of a superseded record. Never updated; removed only with its
/// parent function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSnapshot {
  pub function_id:  i64,
  pub version:      u32,
  pub code:         String,
  pub description:  String,
  pub dependencies: Vec<String>,
  pub test_cases:   Vec<TestCase>,
  /// When this version was originally saved.
  pub saved_at:     DateTime<Utc>,
  pub archived_at:  DateTime<Utc>,
}

// ─── NewFunction ─────────────────────────────────────────────────────────────

/// Input to [`crate::store::FunctionStore::save`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewFunction {
  pub name:              String,
  pub code:              String,
  #[serde(default)]
  pub description:       String,
  #[serde(default)]
  pub description_en:    Option<String>,
  #[serde(default)]
  pub description_jp:    Option<String>,
  #[serde(default)]
  pub tags:              Vec<String>,
  #[serde(default)]
  pub dependencies:      Vec<String>,
  #[serde(default)]
  pub test_cases:        Vec<TestCase>,
  #[serde(default)]
  pub entry_point:       Option<String>,
  #[serde(default)]
  pub skip_verification: bool,
}

impl NewFunction {
  /// Convenience constructor with every optional field left empty.
  pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
    Self { name: name.into(), code: code.into(), ..Self::default() }
  }
}

// ─── Receipts and views ──────────────────────────────────────────────────────

/// Returned by a save that passed the synchronous gates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReceipt {
  pub name:    String,
  pub version: u32,
  pub status:  FunctionStatus,
}

impl fmt::Display for SaveReceipt {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "SUCCESS: Function '{}' (v{}) saved as {}. Background verification, embedding and quality scoring queued.",
      self.name, self.version, self.status
    )
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReceipt {
  pub name:              String,
  pub versions_archived: usize,
}

impl fmt::Display for DeleteReceipt {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "SUCCESS: Function '{}' and its history ({} archived versions) deleted.",
      self.name, self.versions_archived
    )
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
  pub version:     u32,
  pub description: String,
  pub saved_at:    DateTime<Utc>,
  pub is_current:  bool,
}

/// Code and description of one version, archived or current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionView {
  pub version:     u32,
  pub code:        String,
  pub description: String,
  pub saved_at:    DateTime<Utc>,
  pub is_current:  bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
  pub name:        String,
  pub description: String,
  pub tags:        Vec<String>,
  pub status:      FunctionStatus,
  pub version:     u32,
  /// Cosine similarity between the query and the function embedding.
  pub score:       f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSummary {
  pub name:           String,
  pub status:         FunctionStatus,
  pub version:        u32,
  pub description:    String,
  pub tags:           Vec<String>,
  pub call_count:     u64,
  pub last_called_at: Option<DateTime<Utc>>,
  pub updated_at:     DateTime<Utc>,
}

impl From<&FunctionAsset> for FunctionSummary {
  fn from(asset: &FunctionAsset) -> Self {
    Self {
      name:           asset.name.clone(),
      status:         asset.status,
      version:        asset.version,
      description:    asset.primary_description().to_owned(),
      tags:           asset.tags.clone(),
      call_count:     asset.call_count,
      last_called_at: asset.last_called_at,
      updated_at:     asset.updated_at,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentActivity {
  pub name:       String,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
  pub total_functions:    u64,
  pub verified_functions: u64,
  pub total_calls:        u64,
  pub recent_activity:    Vec<RecentActivity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageEntry {
  pub name:          String,
  pub status:        FunctionStatus,
  pub quality_score: u8,
  pub description:   String,
}

impl From<&FunctionAsset> for TriageEntry {
  fn from(asset: &FunctionAsset) -> Self {
    Self {
      name:          asset.name.clone(),
      status:        asset.status,
      quality_score: asset.metadata.quality_score,
      description:   asset.primary_description().to_owned(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
  pub name:                  String,
  pub status:                FunctionStatus,
  pub quality_score:         u8,
  pub code:                  String,
  pub verification_error:    Option<String>,
  pub quality_feedback:      Option<String>,
  pub dependencies:          Vec<String>,
  pub internal_dependencies: Vec<String>,
  pub advice:                Vec<String>,
}

impl DiagnosticReport {
  /// Build a report with advice derived from status and score.
  pub fn from_asset(asset: &FunctionAsset) -> Self {
    let status = asset.status;
    let score = asset.metadata.quality_score;

    let mut advice = Vec::new();
    if status == FunctionStatus::Broken {
      advice.push(
        "CRITICAL: the code failed to load in the sandbox. Fix the module-level code or imports before reuse."
          .to_owned(),
      );
    }
    if status.is_terminal() && score < 50 {
      advice.push(
        "NOTE: quality score is very low. Consider adding docstrings, type hints, and running a formatter."
          .to_owned(),
      );
    }
    if status == FunctionStatus::Failed {
      advice.push(
        "WARNING: verification failed. Review the verification error for the failing test cases."
          .to_owned(),
      );
    }
    if advice.is_empty() {
      advice.push(
        "Logic is stable. Minor refinements may improve the quality score further.".to_owned(),
      );
    }

    Self {
      name: asset.name.clone(),
      status,
      quality_score: score,
      code: asset.code.clone(),
      verification_error: asset.metadata.verification_error.clone(),
      quality_feedback: asset.metadata.quality_feedback.clone(),
      dependencies: asset.dependencies.clone(),
      internal_dependencies: asset.metadata.internal_dependencies.clone(),
      advice,
    }
  }
}
