//! Deterministic cache keys for API requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// HTTP verbs the client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identity of a cacheable read.
///
/// Derived keys are a pure function of method, endpoint and body; explicit
/// keys are used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  /// Derive the key for `(method, endpoint, body)`.
  ///
  /// The body is canonicalized first, so two bodies that differ only in
  /// object key order produce the same key.
  pub fn derive(method: Method, endpoint: &str, body: Option<&Value>) -> Self {
    let canonical_body = body.map(canonicalize).unwrap_or(Value::Null);
    let input = Value::Array(vec![
      Value::String(method.as_str().to_string()),
      Value::String(endpoint.to_string()),
      canonical_body,
    ]);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());

    Self(format!("{}:{}", method.as_str().to_lowercase(), digest))
  }

  /// Caller-chosen key, used exactly as given.
  pub fn custom(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for CacheKey {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

/// Rebuild `value` with every object's keys inserted in sorted order.
fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      Value::Object(
        entries
          .into_iter()
          .map(|(k, v)| (k.clone(), canonicalize(v)))
          .collect(),
      )
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}
