//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings in UTC with nanosecond precision. Lists,
//! test cases, metadata and vectors are compact JSON. Statuses use their snake_case names.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, de::DeserializeOwned};

use fstore_core::function::{FunctionAsset, FunctionStatus, VersionSnapshot};

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

/// Fixed-width so that text order matches time order.
pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Nanos, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn decode_status(s: &str) -> Result<FunctionStatus> {
  FunctionStatus::from_str(s).map_err(|_| Error::Decode(format!("unknown status: {s:?}")))
}

pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
  Ok(serde_json::to_string(value)?)
}

pub fn decode_json<T: DeserializeOwned>(s: &str) -> Result<T> { Ok(serde_json::from_str(s)?) }

fn decode_count(n: i64, column: &str) -> Result<u32> {
  u32::try_from(n).map_err(|_| Error::Decode(format!("{column} out of range: {n}")))
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Every column of `functions`, in table order.
pub const FUNCTION_COLUMNS: &str = "id, name, code, description, description_en, description_jp, \
   tags, dependencies, test_cases, entry_point, status, version, metadata, call_count, \
   last_called_at, created_at, updated_at";

/// Raw values read directly from a `functions` row.
pub struct RawFunction {
  pub id:             i64,
  pub name:           String,
  pub code:           String,
  pub description:    String,
  pub description_en: Option<String>,
  pub description_jp: Option<String>,
  pub tags:           String,
  pub dependencies:   String,
  pub test_cases:     String,
  pub entry_point:    Option<String>,
  pub status:         String,
  pub version:        i64,
  pub metadata:       String,
  pub call_count:     i64,
  pub last_called_at: Option<String>,
  pub created_at:     String,
  pub updated_at:     String,
}

impl RawFunction {
  /// Read a row selected with [`FUNCTION_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:             row.get(0)?,
      name:           row.get(1)?,
      code:           row.get(2)?,
      description:    row.get(3)?,
      description_en: row.get(4)?,
      description_jp: row.get(5)?,
      tags:           row.get(6)?,
      dependencies:   row.get(7)?,
      test_cases:     row.get(8)?,
      entry_point:    row.get(9)?,
      status:         row.get(10)?,
      version:        row.get(11)?,
      metadata:       row.get(12)?,
      call_count:     row.get(13)?,
      last_called_at: row.get(14)?,
      created_at:     row.get(15)?,
      updated_at:     row.get(16)?,
    })
  }

  pub fn into_asset(self) -> Result<FunctionAsset> {
    Ok(FunctionAsset {
      id:             self.id,
      name:           self.name,
      code:           self.code,
      description:    self.description,
      description_en: self.description_en,
      description_jp: self.description_jp,
      tags:           decode_json(&self.tags)?,
      dependencies:   decode_json(&self.dependencies)?,
      test_cases:     decode_json(&self.test_cases)?,
      entry_point:    self.entry_point,
      status:         decode_status(&self.status)?,
      version:        decode_count(self.version, "version")?,
      metadata:       decode_json(&self.metadata)?,
      call_count:     u64::try_from(self.call_count).unwrap_or_default(),
      last_called_at: self.last_called_at.as_deref().map(decode_dt).transpose()?,
      created_at:     decode_dt(&self.created_at)?,
      updated_at:     decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw values read directly from a `function_versions` row.
pub struct RawSnapshot {
  pub function_id:  i64,
  pub version:      i64,
  pub code:         String,
  pub description:  String,
  pub dependencies: String,
  pub test_cases:   String,
  pub saved_at:     String,
  pub archived_at:  String,
}

impl RawSnapshot {
  pub const COLUMNS: &str =
    "function_id, version, code, description, dependencies, test_cases, saved_at, archived_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      function_id:  row.get(0)?,
      version:      row.get(1)?,
      code:         row.get(2)?,
      description:  row.get(3)?,
      dependencies: row.get(4)?,
      test_cases:   row.get(5)?,
      saved_at:     row.get(6)?,
      archived_at:  row.get(7)?,
    })
  }

  pub fn into_snapshot(self) -> Result<VersionSnapshot> {
    Ok(VersionSnapshot {
      function_id:  self.function_id,
      version:      decode_count(self.version, "version")?,
      code:         self.code,
      description:  self.description,
      dependencies: decode_json(&self.dependencies)?,
      test_cases:   decode_json(&self.test_cases)?,
      saved_at:     decode_dt(&self.saved_at)?,
      archived_at:  decode_dt(&self.archived_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timestamps_round_trip_through_text() {
    let now = Utc::now();
    assert_eq!(decode_dt(&encode_dt(now)).unwrap(), now);
    assert!(decode_dt("yesterday").is_err());
  }

  #[test]
  fn unknown_status_is_a_decode_error() {
    assert_eq!(decode_status("verified").unwrap(), FunctionStatus::Verified);
    assert!(matches!(decode_status("active"), Err(Error::Decode(_))));
  }
}
