//! Per-resource freshness: how long a read may be served from the store.

use std::time::Duration;

/// Default TTL for reads that match no rule.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default window during which new callers join an in-flight read.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_secs(10);

/// A TTL applied to every endpoint under `prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlRule {
  pub prefix: String,
  pub ttl: Duration,
}

/// Resolves the store TTL for an endpoint.
///
/// Resource classes tolerate different staleness, so there is no single
/// global TTL: the longest matching prefix rule wins, and a per-call TTL
/// overrides any rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
  default_ttl: Duration,
  rules: Vec<TtlRule>,
}

impl TtlPolicy {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      default_ttl,
      rules: Vec::new(),
    }
  }

  pub fn with_rule(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
    self.rules.push(TtlRule {
      prefix: prefix.into(),
      ttl,
    });
    self
  }

  /// TTL for `endpoint`, honouring an explicit per-call override.
  pub fn ttl_for(&self, endpoint: &str, overridden: Option<Duration>) -> Duration {
    if let Some(ttl) = overridden {
      return ttl;
    }

    self
      .rules
      .iter()
      .filter(|rule| endpoint.starts_with(&rule.prefix))
      .max_by_key(|rule| rule.prefix.len())
      .map(|rule| rule.ttl)
      .unwrap_or(self.default_ttl)
  }
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self::new(DEFAULT_TTL)
  }
}
