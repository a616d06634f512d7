//! Time sources for expiry decisions.
//!
//! Every timestamp the cache writes or compares is epoch milliseconds taken
//! from a [`Clock`], so tests can move time forward without sleeping.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
  fn now_ms(&self) -> i64;
}

/// Wall clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_ms(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicI64,
}

impl ManualClock {
  pub fn new(start_ms: i64) -> Self {
    Self {
      now: AtomicI64::new(start_ms),
    }
  }

  pub fn advance(&self, by: Duration) {
    self.now.fetch_add(millis(by), Ordering::SeqCst);
  }

  pub fn set(&self, now_ms: i64) {
    self.now.store(now_ms, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn millis(duration: Duration) -> i64 {
  i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Deadline `ttl` after `now_ms`, saturating instead of overflowing.
pub fn deadline(now_ms: i64, ttl: Duration) -> i64 {
  now_ms.saturating_add(millis(ttl))
}

/// Render an epoch-millisecond timestamp for display.
pub fn to_datetime(epoch_ms: i64) -> DateTime<Utc> {
  Utc
    .timestamp_millis_opt(epoch_ms)
    .single()
    .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
