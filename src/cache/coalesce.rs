//! In-flight request coalescing.
//!
//! Callers asking for the same key while an operation is outstanding share
//! that operation's result instead of starting another one. The registry is
//! transient: an entry exists only while its operation runs, and only for as
//! long as its coalescing window allows new callers to join.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::clock::{self, Clock, SystemClock};
use crate::error::FetchError;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::coalesce";

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

struct InFlight<T> {
  id: u64,
  handle: SharedOutcome<T>,
  /// New callers may join until this instant (epoch ms)
  join_until: i64,
}

/// Deduplicates concurrent operations by key.
///
/// Operations are spawned onto the tokio runtime, so a caller that drops its
/// future does not cancel the work other callers (or the cache) are waiting on.
pub struct Coalescer<T> {
  in_flight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
  clock: Arc<dyn Clock>,
  next_id: Arc<AtomicU64>,
}

impl<T> Coalescer<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self {
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      clock,
      next_id: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Run `operation` for `key`, or join the one already running.
  ///
  /// A running operation is joined only while `window` has not elapsed since
  /// it started. Every caller sharing an operation receives the same outcome.
  pub async fn run<F, Fut>(
    &self,
    key: &str,
    window: Duration,
    operation: F,
  ) -> Result<T, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let handle = self.join_or_start(key, window, operation);
    handle.await
  }

  /// Number of operations currently registered.
  pub fn in_flight(&self) -> usize {
    mutex_lock(&self.in_flight, SOURCE, "in_flight").len()
  }

  /// Check for a joinable entry and register a new one under a single guard.
  /// Nothing in here awaits.
  fn join_or_start<F, Fut>(&self, key: &str, window: Duration, operation: F) -> SharedOutcome<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let mut registry = mutex_lock(&self.in_flight, SOURCE, "join_or_start");
    let now = self.clock.now_ms();

    if let Some(existing) = registry.get(key) {
      if now < existing.join_until {
        debug!(key, "Joining in-flight request");
        return existing.handle.clone();
      }
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let future = operation();
    let cleanup = Arc::clone(&self.in_flight);
    let owned_key = key.to_string();

    // The registry lock is held until the entry is inserted below, so the
    // task cannot remove it before it exists.
    let task = tokio::spawn(async move {
      let outcome = future.await;
      let mut registry = mutex_lock(&cleanup, SOURCE, "settle");
      if registry.get(&owned_key).is_some_and(|entry| entry.id == id) {
        registry.remove(&owned_key);
      }
      outcome
    });

    let handle = async move {
      match task.await {
        Ok(outcome) => outcome,
        Err(e) => Err(FetchError::Aborted(e.to_string())),
      }
    }
    .boxed()
    .shared();

    debug!(key, window_ms = clock::millis(window), "Starting coalesced request");
    registry.insert(
      key.to_string(),
      InFlight {
        id,
        handle: handle.clone(),
        join_until: clock::deadline(now, window),
      },
    );

    handle
  }
}

impl<T> Default for Coalescer<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for Coalescer<T> {
  fn clone(&self) -> Self {
    Self {
      in_flight: Arc::clone(&self.in_flight),
      clock: Arc::clone(&self.clock),
      next_id: Arc::clone(&self.next_id),
    }
  }
}
