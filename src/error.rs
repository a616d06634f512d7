//! Errors surfaced to callers of the data-access layer.
//!
//! Storage faults are not represented here: they are recovered inside the
//! cache and never reach a caller.

use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed request.
///
/// `Clone` so that every caller coalesced onto one request receives the
/// identical error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// The request never produced a response (connection refused, DNS, TLS...)
  #[error("transport error: {0}")]
  Transport(String),

  /// No response within the configured timeout
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// The server answered with a non-success status
  #[error("server responded with status {status}")]
  Status { status: u16, body: String },

  /// A success status whose body could not be decoded
  #[error("malformed response body: {0}")]
  Malformed(String),

  /// The request could not be built (bad endpoint, unserializable body)
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// The shared request task panicked or was cancelled by runtime shutdown
  #[error("request task aborted: {0}")]
  Aborted(String),
}

impl FetchError {
  /// HTTP status for server-reported failures.
  pub fn status(&self) -> Option<u16> {
    match self {
      FetchError::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Whether the failure happened before any response arrived.
  pub fn is_transport(&self) -> bool {
    matches!(self, FetchError::Transport(_) | FetchError::Timeout(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_accessor() {
    let err = FetchError::Status {
      status: 503,
      body: "maintenance".into(),
    };
    assert_eq!(err.status(), Some(503));
    assert!(!err.is_transport());
    assert_eq!(err.to_string(), "server responded with status 503");

    assert_eq!(FetchError::Timeout(Duration::from_secs(5)).status(), None);
    assert!(FetchError::Timeout(Duration::from_secs(5)).is_transport());
  }
}
