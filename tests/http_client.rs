//! ApiClient over a real HTTP transport against a mock server.

use apicache::api::{ApiClient, FetchError, ReqwestTransport, RequestOptions};
use apicache::cache::{ExpiringStore, MemoryStorage};
use mockito::{Matcher, Server};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn client_for(server: &Server, token: Option<&str>) -> ApiClient {
  let transport = ReqwestTransport::new(
    &server.url(),
    token.map(str::to_string),
    Duration::from_secs(5),
  )
  .expect("Failed to create transport");
  ApiClient::new(Arc::new(transport), ExpiringStore::new(Arc::new(MemoryStorage::new())))
}

#[tokio::test]
async fn test_read_is_served_from_cache_after_first_response() {
  let mut server = Server::new_async().await;
  let mock = server
    .mock("GET", "/api/users/42/stats")
    .match_header("authorization", "Bearer secret")
    .with_status(200)
    .with_header("content-type", "application/json")
    .with_body(r#"{"wins":3}"#)
    .expect(1)
    .create_async()
    .await;

  let client = client_for(&server, Some("secret"));
  let opts = RequestOptions::new();

  let first: Value = client.read("/api/users/42/stats", &opts).await.unwrap();
  let second: Value = client.read("/api/users/42/stats", &opts).await.unwrap();

  assert_eq!(first, json!({"wins": 3}));
  assert_eq!(first, second);
  mock.assert_async().await;
}

#[tokio::test]
async fn test_concurrent_reads_hit_server_once() {
  let mut server = Server::new_async().await;
  let mock = server
    .mock("GET", "/api/leaderboard")
    .with_status(200)
    .with_body("[1,2,3]")
    .expect(1)
    .create_async()
    .await;

  let client = client_for(&server, None);
  let opts = RequestOptions::new();
  let (a, b, c) = tokio::join!(
    client.read::<Vec<u32>>("/api/leaderboard", &opts),
    client.read::<Vec<u32>>("/api/leaderboard", &opts),
    client.read::<Vec<u32>>("/api/leaderboard", &opts)
  );

  assert_eq!(a.unwrap(), vec![1, 2, 3]);
  assert_eq!(b.unwrap(), vec![1, 2, 3]);
  assert_eq!(c.unwrap(), vec![1, 2, 3]);
  mock.assert_async().await;
}

#[tokio::test]
async fn test_server_error_is_surfaced_and_not_cached() {
  let mut server = Server::new_async().await;
  let mock = server
    .mock("GET", "/api/tokens/balance/42")
    .with_status(500)
    .with_body(r#"{"error":"db down"}"#)
    .expect(2)
    .create_async()
    .await;

  let client = client_for(&server, None);
  let opts = RequestOptions::new();

  for _ in 0..2 {
    let err = client
      .read::<Value>("/api/tokens/balance/42", &opts)
      .await
      .unwrap_err();
    assert_eq!(
      err,
      FetchError::Status {
        status: 500,
        body: r#"{"error":"db down"}"#.to_string()
      }
    );
  }
  mock.assert_async().await;
}

#[tokio::test]
async fn test_non_json_success_is_malformed() {
  let mut server = Server::new_async().await;
  let mock = server
    .mock("GET", "/api/feed")
    .with_status(200)
    .with_body("<html>proxy login</html>")
    .expect(2)
    .create_async()
    .await;

  let client = client_for(&server, None);
  let opts = RequestOptions::new();

  for _ in 0..2 {
    let err = client.read::<Value>("/api/feed", &opts).await.unwrap_err();
    assert!(matches!(err, FetchError::Malformed(_)));
  }
  mock.assert_async().await;
}

#[tokio::test]
async fn test_mutation_sends_json_body_and_is_not_cached() {
  let mut server = Server::new_async().await;
  let mock = server
    .mock("POST", "/api/tokens/distribute")
    .match_body(Matcher::Json(json!({"to": 42, "amount": 5})))
    .with_status(201)
    .with_body(r#"{"ok":true}"#)
    .expect(2)
    .create_async()
    .await;

  let client = client_for(&server, None);
  let opts = RequestOptions::new();
  let body = json!({"to": 42, "amount": 5});

  for _ in 0..2 {
    let created: Value = client
      .create("/api/tokens/distribute", &body, &opts)
      .await
      .unwrap();
    assert_eq!(created, json!({"ok": true}));
  }
  mock.assert_async().await;
}

#[tokio::test]
async fn test_empty_delete_response_is_null() {
  let mut server = Server::new_async().await;
  let mock = server
    .mock("DELETE", "/api/posts/1")
    .with_status(204)
    .create_async()
    .await;

  let client = client_for(&server, None);
  let removed: Value = client
    .remove("/api/posts/1", &RequestOptions::new())
    .await
    .unwrap();

  assert_eq!(removed, Value::Null);
  mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_server_is_a_transport_fault() {
  // Nothing listens on port 9 (discard) in test environments
  let transport =
    ReqwestTransport::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
  let client = ApiClient::new(
    Arc::new(transport),
    ExpiringStore::new(Arc::new(MemoryStorage::new())),
  );

  let err = client
    .read::<Value>("/api/anything", &RequestOptions::new())
    .await
    .unwrap_err();
  assert!(matches!(err, FetchError::Transport(_) | FetchError::Timeout(_)));
}
