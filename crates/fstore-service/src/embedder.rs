//! A local, deterministic embedder based on feature hashing.
//!
//! Lower-cased word tokens and adjacent-word bigrams are hashed with SHA-256
//! into a fixed number of signed buckets and the result is L2-normalised. It
//! has no model files and no network access, so it is the default until a
//! real model is configured.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use fstore_core::{Result, capability::Embedder, embedding::ModelIdentity};

pub const HASHING_MODEL: &str = "hashing-v1";
pub const DEFAULT_DIMENSION: usize = 256;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
  dimension: usize,
}

impl Default for HashingEmbedder {
  fn default() -> Self { Self::new(DEFAULT_DIMENSION) }
}

impl HashingEmbedder {
  pub fn new(dimension: usize) -> Self { Self { dimension: dimension.max(1) } }

  pub fn encode(&self, text: &str) -> Vec<f32> {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
      .split(|c: char| !c.is_alphanumeric() && c != '_')
      .filter(|t| !t.is_empty())
      .collect();

    let mut vector = vec![0.0f32; self.dimension];
    for token in &tokens {
      self.add_feature(&mut vector, token, 1.0);
    }
    for pair in tokens.windows(2) {
      self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
      vector.iter_mut().for_each(|x| *x /= norm);
    }
    vector
  }

  fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
    let digest = Sha256::digest(feature.as_bytes());
    let mut bucket = [0u8; 8];
    bucket.copy_from_slice(&digest[..8]);
    let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    vector[index] += sign * weight;
  }
}

#[async_trait]
impl Embedder for HashingEmbedder {
  fn identity(&self) -> ModelIdentity {
    ModelIdentity { name: HASHING_MODEL.into(), dimension: self.dimension }
  }

  async fn embed(&self, text: &str, _is_query: bool) -> Result<Vec<f32>> { Ok(self.encode(text)) }
}

#[cfg(test)]
mod tests {
  use fstore_core::embedding::cosine_similarity;

  use super::*;

  #[test]
  fn deterministic_and_normalised() {
    let e = HashingEmbedder::new(64);
    let a = e.encode("Parse a CSV file into rows");
    assert_eq!(a, e.encode("parse a csv FILE into rows"));
    assert_eq!(a.len(), 64);
    let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
  }

  #[test]
  fn related_text_scores_higher() {
    let e = HashingEmbedder::default();
    let doc = e.encode("add two numbers and return the sum");
    let near = e.encode("sum of two numbers");
    let far = e.encode("download a web page over http");
    assert!(cosine_similarity(&doc, &near) > cosine_similarity(&doc, &far));
  }

  #[test]
  fn empty_text_is_the_zero_vector() {
    let e = HashingEmbedder::new(8);
    assert!(e.encode("  !! ").iter().all(|x| *x == 0.0));
  }
}
