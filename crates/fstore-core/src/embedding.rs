//! Embedding vectors and the identity of the model that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name and output width of an embedding model. Stored next to every vector so
/// a model swap can be detected and stale rows rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
  pub name:      String,
  pub dimension: usize,
}

/// One live embedding row. At most one exists per `(function_id, model_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingVector {
  pub function_id: i64,
  pub model_name:  String,
  pub dimension:   usize,
  pub vector:      Vec<f32>,
  pub encoded_at:  DateTime<Utc>,
}

/// Cosine similarity of two vectors; `0.0` when either is zero or the lengths
/// differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
  if a.len() != b.len() || a.is_empty() {
    return 0.0;
  }
  let mut dot = 0.0f32;
  let mut norm_a = 0.0f32;
  let mut norm_b = 0.0f32;
  for (x, y) in a.iter().zip(b) {
    dot += x * y;
    norm_a += x * x;
    norm_b += y * y;
  }
  if norm_a == 0.0 || norm_b == 0.0 {
    return 0.0;
  }
  dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn identical_vectors_score_one() {
    let v = [0.3, 0.4, 0.5];
    assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn mismatched_lengths_score_zero() {
    assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
  }
}
