//! Durable expiring store: namespaced, timestamped entries with lazy expiry.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{self, Clock, SystemClock};

use super::storage::Storage;
use super::traits::CacheEntry;

/// Prefix applied to every key this store writes.
pub const DEFAULT_NAMESPACE: &str = "apicache:";

/// Expiring key-value cache over an unreliable [`Storage`] backend.
///
/// Storage faults never escape: a failed write is skipped, a failed or
/// corrupted read is a miss. Expired entries are purged when read; there is
/// no background sweep.
pub struct ExpiringStore {
  storage: Arc<dyn Storage>,
  clock: Arc<dyn Clock>,
  namespace: String,
}

impl ExpiringStore {
  /// Create a store over `storage` using the wall clock.
  pub fn new(storage: Arc<dyn Storage>) -> Self {
    Self::with_clock(storage, Arc::new(SystemClock))
  }

  pub fn with_clock(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
    Self {
      storage,
      clock,
      namespace: DEFAULT_NAMESPACE.to_string(),
    }
  }

  /// Use a different key prefix.
  pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.namespace, key)
  }

  /// Write `data` under `key`, live for `ttl` from now.
  ///
  /// Serialization and storage failures degrade to a no-op.
  pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) {
    let now = self.clock.now_ms();
    let entry = CacheEntry::new(data, now, clock::deadline(now, ttl));

    let raw = match serde_json::to_string(&entry) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(key, error = %e, "Skipping cache write: payload is not serializable");
        return;
      }
    };

    match self.storage.set_item(&self.storage_key(key), &raw) {
      Ok(()) => debug!(key, ttl_ms = clock::millis(ttl), "Cached entry"),
      Err(e) => warn!(key, error = %e, "Skipping cache write: storage rejected it"),
    }
  }

  /// Read the live entry under `key`, purging it if it is expired or corrupted.
  pub fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    let storage_key = self.storage_key(key);

    let raw = match self.storage.get_item(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        debug!(key, error = %e, "Cache read failed, treating as miss");
        return None;
      }
    };

    let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        debug!(key, error = %e, "Purging corrupted cache entry");
        self.purge(&storage_key);
        return None;
      }
    };

    if !entry.is_live(self.clock.now_ms()) {
      debug!(key, expires_at = entry.expires_at, "Purging expired cache entry");
      self.purge(&storage_key);
      return None;
    }

    Some(entry)
  }

  /// Read the live value under `key`.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_entry(key).map(|entry| entry.data)
  }

  /// Whether a live entry exists under `key`. Purges like [`get`](Self::get).
  pub fn has(&self, key: &str) -> bool {
    self.get_entry::<serde_json::Value>(key).is_some()
  }

  /// Delete the entry under `key`.
  pub fn remove(&self, key: &str) {
    self.purge(&self.storage_key(key));
  }

  /// Delete every entry in this store's namespace, leaving other keys alone.
  pub fn clear(&self) {
    let keys = match self.storage.keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "Failed to list cache keys for clear");
        return;
      }
    };

    let mut removed = 0usize;
    for key in keys.iter().filter(|k| k.starts_with(&self.namespace)) {
      self.purge(key);
      removed += 1;
    }
    debug!(removed, namespace = %self.namespace, "Cleared cache namespace");
  }

  fn purge(&self, storage_key: &str) {
    if let Err(e) = self.storage.remove_item(storage_key) {
      warn!(key = storage_key, error = %e, "Failed to remove cache entry");
    }
  }
}

impl Clone for ExpiringStore {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      namespace: self.namespace.clone(),
    }
  }
}
