//! A bounded cache of query embeddings that only admits popular queries.
//!
//! How often a query has been seen is counted per normalised text (trimmed,
//! lower-cased). Vectors are stored per SHA-256 of the raw text. A query is
//! admitted once its count reaches the promotion threshold; at capacity the
//! least recently accessed entry is evicted.
//!
//! Counts are bounded too: once more distinct queries are tracked than
//! [`PopularQueryCache::frequency_limit`] allows, every count is halved and
//! the ones that reach zero are forgotten.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

pub const DEFAULT_THRESHOLD: u32 = 3;
pub const DEFAULT_CAPACITY: usize = 500;

/// Distinct queries tracked per cache slot before counts are aged.
const FREQUENCY_PER_SLOT: usize = 4;
const MIN_FREQUENCY_LIMIT: usize = 64;

struct CacheEntry {
  vector:      Vec<f32>,
  last_access: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub hits:     u64,
  pub misses:   u64,
  pub entries:  usize,
  pub capacity: usize,
}

pub struct PopularQueryCache {
  threshold: u32,
  capacity:  usize,
  frequency: HashMap<String, u32>,
  entries:   HashMap<String, CacheEntry>,
  /// Logical clock; bumped on every access so recency has no ties.
  clock:     u64,
  hits:      u64,
  misses:    u64,
}

impl Default for PopularQueryCache {
  fn default() -> Self { Self::new(DEFAULT_THRESHOLD, DEFAULT_CAPACITY) }
}

fn normalize(query: &str) -> String { query.trim().to_lowercase() }

fn storage_key(query: &str) -> String { hex::encode(Sha256::digest(query.as_bytes())) }

impl PopularQueryCache {
  pub fn new(threshold: u32, capacity: usize) -> Self {
    Self {
      threshold: threshold.max(1),
      capacity,
      frequency: HashMap::new(),
      entries: HashMap::new(),
      clock: 0,
      hits: 0,
      misses: 0,
    }
  }

  /// How many distinct queries are counted before the counts are aged.
  pub fn frequency_limit(&self) -> usize {
    (self.capacity * FREQUENCY_PER_SLOT).max(MIN_FREQUENCY_LIMIT)
  }

  pub fn tracked_queries(&self) -> usize { self.frequency.len() }

  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  /// The cached vector for `query`, refreshing its recency.
  pub fn get(&mut self, query: &str) -> Option<Vec<f32>> {
    let now = self.tick();
    match self.entries.get_mut(&storage_key(query)) {
      Some(entry) => {
        entry.last_access = now;
        self.hits += 1;
        debug!(query, "query cache hit");
        Some(entry.vector.clone())
      }
      None => {
        self.misses += 1;
        None
      }
    }
  }

  /// Count one occurrence of `query` and store `vector` if the query is now
  /// popular enough. Returns whether it was stored.
  pub fn maybe_cache(&mut self, query: &str, vector: Vec<f32>) -> bool {
    let count = self.frequency.entry(normalize(query)).or_insert(0);
    *count = count.saturating_add(1);
    let count = *count;
    if self.frequency.len() > self.frequency_limit() {
      self.age_frequencies();
    }
    if count < self.threshold || self.capacity == 0 {
      return false;
    }

    let key = storage_key(query);
    if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
      self.evict_oldest();
    }
    let now = self.tick();
    self.entries.insert(key, CacheEntry { vector, last_access: now });
    true
  }

  fn age_frequencies(&mut self) {
    let before = self.frequency.len();
    let limit = self.frequency_limit();
    while self.frequency.len() > limit {
      self.frequency.retain(|_, count| {
        *count /= 2;
        *count > 0
      });
    }
    debug!(before, after = self.frequency.len(), "aged query frequencies");
  }

  fn evict_oldest(&mut self) {
    let oldest = self
      .entries
      .iter()
      .min_by_key(|(_, entry)| entry.last_access)
      .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
      self.entries.remove(&key);
      debug!(%key, "evicted least recently used query");
    }
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      hits:     self.hits,
      misses:   self.misses,
      entries:  self.entries.len(),
      capacity: self.capacity,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn v(x: f32) -> Vec<f32> { vec![x] }

  #[test]
  fn promoted_on_the_threshold_occurrence() {
    let mut cache = PopularQueryCache::new(3, 10);
    assert!(!cache.maybe_cache("sort a list", v(1.0)));
    assert!(cache.get("sort a list").is_none());
    assert!(!cache.maybe_cache("sort a list", v(1.0)));
    assert!(cache.get("sort a list").is_none());
    assert!(cache.maybe_cache("sort a list", v(1.0)));
    assert_eq!(cache.get("sort a list"), Some(v(1.0)));
  }

  #[test]
  fn popularity_is_counted_on_normalised_text() {
    let mut cache = PopularQueryCache::new(3, 10);
    cache.maybe_cache("Sort A List", v(1.0));
    cache.maybe_cache("  sort a list ", v(1.0));
    assert!(cache.maybe_cache("sort a list", v(1.0)));
    // Storage is keyed by the raw text.
    assert!(cache.get("Sort A List").is_none());
    assert!(cache.get("sort a list").is_some());
  }

  #[test]
  fn eviction_removes_the_least_recently_accessed_entry() {
    let mut cache = PopularQueryCache::new(1, 2);
    cache.maybe_cache("a", v(1.0));
    cache.maybe_cache("b", v(2.0));
    // Touch "a" so "b" becomes the oldest.
    assert!(cache.get("a").is_some());

    cache.maybe_cache("c", v(3.0));
    assert_eq!(cache.stats().entries, 2);
    assert!(cache.get("b").is_none());
    assert!(cache.get("a").is_some());
    assert!(cache.get("c").is_some());
  }

  #[test]
  fn never_exceeds_capacity() {
    let mut cache = PopularQueryCache::new(1, 5);
    for i in 0..50 {
      cache.maybe_cache(&format!("query {i}"), v(i as f32));
      assert!(cache.stats().entries <= 5);
    }
    let mut empty = PopularQueryCache::new(1, 0);
    assert!(!empty.maybe_cache("q", v(0.0)));
    assert_eq!(empty.stats().entries, 0);
  }

  #[test]
  fn frequency_table_stays_bounded() {
    let mut cache = PopularQueryCache::new(3, 2);
    let limit = cache.frequency_limit();
    for _ in 0..20 {
      cache.maybe_cache("popular", v(1.0));
    }
    for i in 0..limit * 3 {
      cache.maybe_cache(&format!("one-off {i}"), v(0.0));
      assert!(cache.tracked_queries() <= limit);
    }
    // The popular query survives aging with a reduced count.
    assert!(cache.frequency.get("popular").is_some_and(|&count| count > 0));
  }

  #[test]
  fn hit_and_miss_counters() {
    let mut cache = PopularQueryCache::new(1, 4);
    assert!(cache.get("x").is_none());
    cache.maybe_cache("x", v(1.0));
    cache.get("x");
    cache.get("x");
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (2, 1));
  }
}
