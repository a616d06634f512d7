//! Property-based tests for expiry and key derivation.
//!
//! 1. TTL: an entry is returned strictly before its TTL elapses, never after
//! 2. Determinism: deriving a key twice gives the same string
//! 3. Distinctness: requests differing in any component get different keys

use apicache::api::{CacheKey, Method};
use proptest::prelude::*;
use serde_json::{Map, Value};
use std::time::Duration;

mod common;

fn method_strategy() -> impl Strategy<Value = Method> {
  prop_oneof![
    Just(Method::Get),
    Just(Method::Post),
    Just(Method::Put),
    Just(Method::Delete),
  ]
}

fn endpoint_strategy() -> impl Strategy<Value = String> {
  prop::string::string_regex("/api/[a-z0-9/?=&]{0,24}").expect("Valid regex")
}

/// Flat JSON objects; `None` stands for "no body".
fn body_strategy() -> impl Strategy<Value = Option<Value>> {
  prop::option::of(
    prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..6).prop_map(|fields| {
      Value::Object(
        fields
          .into_iter()
          .map(|(k, v)| (k, Value::from(v)))
          .collect::<Map<String, Value>>(),
      )
    }),
  )
}

proptest! {
  #[test]
  fn proptest_entry_live_until_ttl(ttl_ms in 1u64..10_000_000, fraction in 0.0f64..1.0) {
    let clock = common::manual_clock();
    let store = common::memory_store(clock.clone());
    let elapsed = ((ttl_ms as f64) * fraction) as u64;

    store.set("entry", &"value", Duration::from_millis(ttl_ms));
    clock.advance(Duration::from_millis(elapsed.min(ttl_ms - 1)));
    let live = store.get::<String>("entry");
    prop_assert_eq!(live.as_deref(), Some("value"));

    clock.set(common::START_MS + ttl_ms as i64);
    prop_assert_eq!(store.get::<String>("entry"), None);
  }

  #[test]
  fn proptest_key_determinism(
    method in method_strategy(),
    endpoint in endpoint_strategy(),
    body in body_strategy(),
  ) {
    let first = CacheKey::derive(method, &endpoint, body.as_ref());
    let second = CacheKey::derive(method, &endpoint, body.clone().as_ref());
    prop_assert_eq!(first, second);
  }

  #[test]
  fn proptest_distinct_requests_get_distinct_keys(
    a in (method_strategy(), endpoint_strategy(), body_strategy()),
    b in (method_strategy(), endpoint_strategy(), body_strategy()),
  ) {
    let key_a = CacheKey::derive(a.0, &a.1, a.2.as_ref());
    let key_b = CacheKey::derive(b.0, &b.1, b.2.as_ref());
    if a == b {
      prop_assert_eq!(key_a, key_b);
    } else {
      prop_assert_ne!(key_a, key_b);
    }
  }
}

#[test]
fn body_key_order_does_not_change_the_key() {
  let a: Value = serde_json::from_str(r#"{"page":2,"filter":{"b":1,"a":2}}"#).unwrap();
  let b: Value = serde_json::from_str(r#"{"filter":{"a":2,"b":1},"page":2}"#).unwrap();
  assert_eq!(
    CacheKey::derive(Method::Post, "/api/search", Some(&a)),
    CacheKey::derive(Method::Post, "/api/search", Some(&b))
  );
}
