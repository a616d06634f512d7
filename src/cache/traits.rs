//! Core types for the durable cache.

use serde::{Deserialize, Serialize};

/// A value as written to durable storage.
///
/// Entries are never mutated in place; a newer `set` under the same key
/// replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  /// The cached payload
  pub data: T,
  /// When the entry was written (epoch ms)
  pub stored_at: i64,
  /// First instant at which the entry is no longer served (epoch ms)
  pub expires_at: i64,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, stored_at: i64, expires_at: i64) -> Self {
    Self {
      data,
      stored_at,
      expires_at,
    }
  }

  /// An entry is live strictly before its expiry instant.
  pub fn is_live(&self, now_ms: i64) -> bool {
    now_ms < self.expires_at
  }
}
