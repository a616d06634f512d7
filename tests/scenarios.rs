//! End-to-end behaviour of the cache layer through the public API.

mod common;

use apicache::api::{ApiClient, CacheKey, FetchError, Method, RequestOptions};
use apicache::cache::{Coalescer, ExpiringStore, MemoryStorage, Storage};
use common::{api_client, manual_clock, memory_store, CountingTransport, FailingStorage};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Stats {
  wins: u32,
  losses: u32,
}

#[test]
fn entry_expires_after_its_ttl() {
  let clock = manual_clock();
  let store = memory_store(clock.clone());
  let value = json!([{"user": "alice", "score": 12}]);

  store.set("leaderboard", &value, Duration::from_millis(2_000));
  assert_eq!(store.get::<Value>("leaderboard"), Some(value));

  clock.advance(Duration::from_millis(2_001));
  assert_eq!(store.get::<Value>("leaderboard"), None);
  assert!(!store.has("leaderboard"));
}

#[tokio::test]
async fn simultaneous_reads_share_one_request() {
  let (client, transport, _) = api_client();
  transport.respond(Method::Get, "/api/users/42/stats", 200, r#"{"wins":3,"losses":1}"#);
  transport.set_delay(Duration::from_millis(20));

  let opts = RequestOptions::new();
  let (a, b) = tokio::join!(
    client.read::<Stats>("/api/users/42/stats", &opts),
    client.read::<Stats>("/api/users/42/stats", &opts)
  );

  assert_eq!(a.unwrap(), Stats { wins: 3, losses: 1 });
  assert_eq!(b.unwrap(), Stats { wins: 3, losses: 1 });
  assert_eq!(transport.count(Method::Get, "/api/users/42/stats"), 1);
  assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn create_does_not_touch_unrelated_reads() {
  let (client, transport, _) = api_client();
  transport.respond(Method::Post, "/api/tokens/distribute", 201, r#"{"ok":true}"#);
  transport.respond(Method::Get, "/api/tokens/balance/42", 200, r#"{"balance":10}"#);
  let opts = RequestOptions::new();

  let created: Value = client
    .create("/api/tokens/distribute", &json!({"to": 42, "amount": 5}), &opts)
    .await
    .unwrap();
  assert_eq!(created, json!({"ok": true}));

  let balance: Value = client.read("/api/tokens/balance/42", &opts).await.unwrap();
  assert_eq!(balance, json!({"balance": 10}));
  assert_eq!(transport.count(Method::Get, "/api/tokens/balance/42"), 1);

  // A second create still leaves the cached read in place
  client
    .create::<Value, _>("/api/tokens/distribute", &json!({"to": 42, "amount": 1}), &opts)
    .await
    .unwrap();
  client.read::<Value>("/api/tokens/balance/42", &opts).await.unwrap();
  assert_eq!(transport.count(Method::Get, "/api/tokens/balance/42"), 1);

  // Until the caller invalidates it
  client.invalidate("/api/tokens/balance/42", &opts);
  client.read::<Value>("/api/tokens/balance/42", &opts).await.unwrap();
  assert_eq!(transport.count(Method::Get, "/api/tokens/balance/42"), 2);
}

#[test]
fn quota_error_on_set_is_swallowed() {
  let storage = Arc::new(MemoryStorage::new().with_quota(32));
  let store = ExpiringStore::with_clock(storage, manual_clock());
  let big = "x".repeat(1_024);

  store.set("report", &big, Duration::from_secs(60));

  assert_eq!(store.get::<String>("report"), None);
  assert!(!store.has("report"));
}

#[tokio::test]
async fn coalesced_callers_all_receive_one_outcome() {
  let (client, transport, _) = api_client();
  transport.respond(Method::Get, "/api/leaderboard", 200, r#"[1,2,3]"#);
  transport.set_delay(Duration::from_millis(20));

  let opts = RequestOptions::new();
  let reads = (0..8).map(|_| client.read::<Vec<u32>>("/api/leaderboard", &opts));
  let outcomes = join_all(reads).await;

  assert!(outcomes.iter().all(|o| o.as_ref().unwrap() == &vec![1, 2, 3]));
  assert_eq!(transport.count(Method::Get, "/api/leaderboard"), 1);
}

#[tokio::test]
async fn coalesced_callers_all_receive_the_same_failure() {
  let (client, transport, _) = api_client();
  transport.fail(
    Method::Get,
    "/api/users/7/stats",
    FetchError::Transport("connection refused".into()),
  );
  transport.set_delay(Duration::from_millis(20));

  let opts = RequestOptions::new();
  let reads = (0..5).map(|_| client.read::<Stats>("/api/users/7/stats", &opts));
  let outcomes = join_all(reads).await;

  for outcome in outcomes {
    assert_eq!(
      outcome.unwrap_err(),
      FetchError::Transport("connection refused".into())
    );
  }
  assert_eq!(transport.count(Method::Get, "/api/users/7/stats"), 1);
  assert!(client.cached_entry("/api/users/7/stats", &opts).is_none());
}

#[tokio::test]
async fn coalescer_runs_operation_once_for_concurrent_callers() {
  let coalescer: Coalescer<u32> = Coalescer::with_clock(manual_clock());
  let calls = Arc::new(AtomicUsize::new(0));

  let runs = (0..10).map(|_| {
    let calls = calls.clone();
    coalescer.run("key", Duration::from_secs(10), move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(10)).await;
      Ok(7)
    })
  });
  let outcomes = join_all(runs).await;

  assert!(outcomes.into_iter().all(|o| o == Ok(7)));
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(coalescer.in_flight(), 0);
}

#[tokio::test]
async fn mutations_never_read_or_write_the_store() {
  let transport = CountingTransport::new();
  let storage = Arc::new(MemoryStorage::new());
  let store = ExpiringStore::with_clock(storage.clone(), manual_clock());
  let client = ApiClient::new(transport.clone(), store.clone());

  let body = json!({"title": "draft"});
  // Entries a mutation could wrongly consult
  store.set(
    CacheKey::derive(Method::Get, "/api/posts/1", None).as_str(),
    &json!({"title": "cached"}),
    Duration::from_secs(60),
  );
  store.set(
    CacheKey::derive(Method::Post, "/api/posts", Some(&body)).as_str(),
    &json!({"id": 0}),
    Duration::from_secs(60),
  );
  let keys_before = storage.keys().unwrap();

  transport.respond(Method::Post, "/api/posts", 201, r#"{"id":1}"#);
  transport.respond(Method::Put, "/api/posts/1", 200, r#"{"id":1,"title":"final"}"#);
  transport.respond(Method::Delete, "/api/posts/1", 204, "");
  let opts = RequestOptions::new();

  let created: Value = client.create("/api/posts", &body, &opts).await.unwrap();
  let replaced: Value = client
    .replace("/api/posts/1", &json!({"title": "final"}), &opts)
    .await
    .unwrap();
  let removed: Value = client.remove("/api/posts/1", &opts).await.unwrap();

  assert_eq!(created, json!({"id": 1}));
  assert_eq!(replaced, json!({"id": 1, "title": "final"}));
  assert_eq!(removed, Value::Null);
  assert_eq!(transport.sent().len(), 3);
  assert_eq!(storage.keys().unwrap(), keys_before);
}

#[tokio::test]
async fn failed_responses_are_never_cached() {
  let (client, transport, _) = api_client();
  let opts = RequestOptions::new();

  transport.respond(Method::Get, "/api/users/1/stats", 503, "maintenance");
  let err = client.read::<Stats>("/api/users/1/stats", &opts).await.unwrap_err();
  assert_eq!(
    err,
    FetchError::Status {
      status: 503,
      body: "maintenance".into()
    }
  );

  transport.respond(Method::Get, "/api/users/1/stats", 200, "<html>oops</html>");
  let err = client.read::<Stats>("/api/users/1/stats", &opts).await.unwrap_err();
  assert!(matches!(err, FetchError::Malformed(_)));

  // Valid JSON of the wrong shape is a garbled success
  transport.respond(Method::Get, "/api/users/1/stats", 200, r#"{"wins":"many"}"#);
  let err = client.read::<Stats>("/api/users/1/stats", &opts).await.unwrap_err();
  assert!(matches!(err, FetchError::Malformed(_)));

  assert!(client.cached_entry("/api/users/1/stats", &opts).is_none());
  assert_eq!(transport.count(Method::Get, "/api/users/1/stats"), 3);
}

#[tokio::test]
async fn failing_storage_never_escapes_the_client() {
  let transport = CountingTransport::new();
  transport.respond(Method::Get, "/api/leaderboard", 200, "[1]");
  let store = ExpiringStore::with_clock(Arc::new(FailingStorage), manual_clock());
  let client = ApiClient::new(transport.clone(), store.clone());
  let opts = RequestOptions::new();

  assert_eq!(client.read::<Vec<u32>>("/api/leaderboard", &opts).await.unwrap(), vec![1]);
  assert_eq!(client.read::<Vec<u32>>("/api/leaderboard", &opts).await.unwrap(), vec![1]);
  assert_eq!(transport.count(Method::Get, "/api/leaderboard"), 2);

  store.set("k", &1, Duration::from_secs(60));
  assert_eq!(store.get::<u32>("k"), None);
  client.invalidate("/api/leaderboard", &opts);
  client.invalidate_all();
}

#[tokio::test]
async fn per_resource_ttls_apply() {
  let (client, transport, clock) = api_client();
  transport.respond(Method::Get, "/api/leaderboard", 200, "[1]");
  transport.respond(Method::Get, "/api/tokens/balance/42", 200, "10");
  let opts = RequestOptions::new();

  client.read::<Value>("/api/leaderboard", &opts).await.unwrap();
  client.read::<Value>("/api/tokens/balance/42", &opts).await.unwrap();

  clock.advance(Duration::from_secs(31));
  client.read::<Value>("/api/leaderboard", &opts).await.unwrap();
  client.read::<Value>("/api/tokens/balance/42", &opts).await.unwrap();

  assert_eq!(transport.count(Method::Get, "/api/leaderboard"), 1);
  assert_eq!(transport.count(Method::Get, "/api/tokens/balance/42"), 2);
}

#[tokio::test]
async fn custom_key_shares_cache_across_endpoints() {
  let (client, transport, _) = api_client();
  transport.respond(Method::Get, "/api/me", 200, r#"{"id":42}"#);
  let opts = RequestOptions::new().with_cache_key("current-user");

  client.read::<Value>("/api/me", &opts).await.unwrap();
  let cached: Value = client.read("/api/users/42", &opts).await.unwrap();

  assert_eq!(cached, json!({"id": 42}));
  assert_eq!(transport.sent().len(), 1);
}
