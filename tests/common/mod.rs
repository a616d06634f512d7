//! Shared fakes for integration tests.

#![allow(dead_code)]

use apicache::api::{ApiClient, ApiRequest, ApiResponse, FetchError, Method, Transport, TtlPolicy};
use apicache::cache::{ExpiringStore, MemoryStorage, Storage};
use apicache::clock::ManualClock;
use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const START_MS: i64 = 1_700_000_000_000;

pub fn manual_clock() -> Arc<ManualClock> {
  Arc::new(ManualClock::new(START_MS))
}

pub fn memory_store(clock: Arc<ManualClock>) -> ExpiringStore {
  ExpiringStore::with_clock(Arc::new(MemoryStorage::new()), clock)
}

/// Transport that answers from fixed responses, counts requests and can
/// hold each response back for a while.
#[derive(Default)]
pub struct CountingTransport {
  responses: Mutex<HashMap<(Method, String), Result<ApiResponse, FetchError>>>,
  sent: Mutex<Vec<ApiRequest>>,
  delay: Mutex<Option<Duration>>,
}

impl CountingTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, method: Method, endpoint: &str, status: u16, body: &str) {
    self
      .responses
      .lock()
      .unwrap()
      .insert((method, endpoint.to_string()), Ok(ApiResponse::new(status, body)));
  }

  pub fn fail(&self, method: Method, endpoint: &str, error: FetchError) {
    self
      .responses
      .lock()
      .unwrap()
      .insert((method, endpoint.to_string()), Err(error));
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn sent(&self) -> Vec<ApiRequest> {
    self.sent.lock().unwrap().clone()
  }

  pub fn count(&self, method: Method, endpoint: &str) -> usize {
    self
      .sent()
      .iter()
      .filter(|r| r.method == method && r.endpoint == endpoint)
      .count()
  }
}

#[async_trait]
impl Transport for CountingTransport {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, FetchError> {
    self.sent.lock().unwrap().push(request.clone());
    let delay = *self.delay.lock().unwrap();
    match delay {
      Some(delay) => tokio::time::sleep(delay).await,
      None => tokio::task::yield_now().await,
    }
    self
      .responses
      .lock()
      .unwrap()
      .get(&(request.method, request.endpoint.clone()))
      .cloned()
      .unwrap_or_else(|| Ok(ApiResponse::new(404, "not found")))
  }
}

/// Client over a counting transport and in-memory storage driven by a manual clock.
pub fn api_client() -> (ApiClient, Arc<CountingTransport>, Arc<ManualClock>) {
  let transport = CountingTransport::new();
  let clock = manual_clock();
  let client = ApiClient::new(transport.clone(), memory_store(clock.clone())).with_policy(
    TtlPolicy::new(Duration::from_secs(300))
      .with_rule("/api/leaderboard", Duration::from_secs(120))
      .with_rule("/api/tokens/balance", Duration::from_secs(30)),
  );
  (client, transport, clock)
}

/// Storage whose every call fails, like a full or disabled backend.
pub struct FailingStorage;

impl Storage for FailingStorage {
  fn get_item(&self, _key: &str) -> Result<Option<String>> {
    Err(eyre!("storage unavailable"))
  }

  fn set_item(&self, _key: &str, _value: &str) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn remove_item(&self, _key: &str) -> Result<()> {
    Err(eyre!("storage unavailable"))
  }

  fn keys(&self) -> Result<Vec<String>> {
    Err(eyre!("storage unavailable"))
  }
}
