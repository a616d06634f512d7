//! Unified data-access client: verb methods over the API with a cached read path.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheEntry, Coalescer, ExpiringStore, MemoryStorage, SqliteStorage, Storage};
use crate::config::Config;
use crate::error::FetchError;

use super::key::{CacheKey, Method};
use super::policy::{TtlPolicy, DEFAULT_COALESCE_WINDOW};
use super::transport::{ApiRequest, ReqwestTransport, Transport};

/// Per-call options.
///
/// Only `read`, `invalidate` and `cached_entry` look at the cache fields;
/// mutations ignore them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
  /// Use this key instead of deriving one from the request
  pub cache_key: Option<String>,
  /// Store TTL for this read, overriding the policy
  pub ttl: Option<Duration>,
  /// How long new callers may join this read while it is in flight
  pub coalesce_window: Option<Duration>,
  /// Skip the store lookup; the response still repopulates it
  pub force_refresh: bool,
}

impl RequestOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_coalesce_window(mut self, window: Duration) -> Self {
    self.coalesce_window = Some(window);
    self
  }

  pub fn force_refresh(mut self) -> Self {
    self.force_refresh = true;
    self
  }
}

/// API client with a durable read cache and in-flight read coalescing.
///
/// Reads consult the store first and only reach the network on a miss;
/// concurrent misses for the same key share one request. Mutations always go
/// to the network and never touch the store: callers that need
/// read-after-write consistency call [`invalidate`](Self::invalidate).
#[derive(Clone)]
pub struct ApiClient {
  transport: Arc<dyn Transport>,
  store: ExpiringStore,
  coalescer: Coalescer<Value>,
  policy: TtlPolicy,
  coalesce_window: Duration,
}

impl ApiClient {
  /// Create a client over `transport`, caching reads in `store`.
  ///
  /// The coalescer shares the store's clock.
  pub fn new(transport: Arc<dyn Transport>, store: ExpiringStore) -> Self {
    let coalescer = Coalescer::with_clock(Arc::clone(store.clock()));
    Self {
      transport,
      store,
      coalescer,
      policy: TtlPolicy::default(),
      coalesce_window: DEFAULT_COALESCE_WINDOW,
    }
  }

  /// Build the HTTP client, storage and policy described by `config`.
  pub fn from_config(config: &Config, persist: bool) -> Result<Self> {
    let transport = ReqwestTransport::new(
      &config.api.base_url,
      Config::get_api_token(),
      config.api.timeout(),
    )?;
    debug!(base_url = %transport.base_url(), persist, "Configured API client");

    let storage: Arc<dyn Storage> = if persist {
      let storage = match &config.cache.path {
        Some(path) => SqliteStorage::open(path)?,
        None => SqliteStorage::open_default()?,
      };
      match config.cache.quota_bytes {
        Some(quota) => Arc::new(storage.with_quota(quota)),
        None => Arc::new(storage),
      }
    } else {
      let storage = MemoryStorage::new();
      match config.cache.quota_bytes {
        Some(quota) => Arc::new(storage.with_quota(quota)),
        None => Arc::new(storage),
      }
    };

    let store = ExpiringStore::new(storage).with_namespace(config.cache.namespace.clone());

    Ok(
      Self::new(Arc::new(transport), store)
        .with_policy(config.cache.ttl_policy())
        .with_coalesce_window(config.cache.coalesce_window()),
    )
  }

  pub fn with_policy(mut self, policy: TtlPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_coalesce_window(mut self, window: Duration) -> Self {
    self.coalesce_window = window;
    self
  }

  /// The store backing the read cache.
  pub fn store(&self) -> &ExpiringStore {
    &self.store
  }

  pub fn policy(&self) -> &TtlPolicy {
    &self.policy
  }

  /// Number of reads currently on the wire.
  pub fn in_flight(&self) -> usize {
    self.coalescer.in_flight()
  }

  /// Key the read cache uses for `endpoint`.
  pub fn read_key(&self, endpoint: &str, options: &RequestOptions) -> CacheKey {
    match &options.cache_key {
      Some(key) => CacheKey::custom(key.clone()),
      None => CacheKey::derive(Method::Get, endpoint, None),
    }
  }

  /// Read `endpoint`, serving from the store when a live entry exists.
  ///
  /// Only successful responses that decode as `T` are stored.
  pub async fn read<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    options: &RequestOptions,
  ) -> Result<T, FetchError> {
    let key = self.read_key(endpoint, options);

    if !options.force_refresh {
      if let Some(cached) = self.store.get::<Value>(key.as_str()) {
        match T::deserialize(&cached) {
          Ok(data) => {
            debug!(endpoint, key = %key, "Cache hit");
            return Ok(data);
          }
          Err(e) => {
            debug!(
              endpoint,
              key = %key,
              error = %e,
              "Cached entry has the wrong shape, refetching"
            );
            self.store.remove(key.as_str());
          }
        }
      }
    }

    debug!(endpoint, key = %key, "Cache miss");

    let ttl = self.policy.ttl_for(endpoint, options.ttl);
    let window = options.coalesce_window.unwrap_or(self.coalesce_window);
    let transport = Arc::clone(&self.transport);
    let store = self.store.clone();
    let request = ApiRequest::new(Method::Get, endpoint);
    let store_key = key.as_str().to_string();
    let validate: fn(&Value) -> Result<(), FetchError> = decodes_as::<T>;

    let value = self
      .coalescer
      .run(key.as_str(), window, move || async move {
        let value = send_json(transport.as_ref(), request).await?;
        validate(&value)?;
        if !ttl.is_zero() {
          store.set(&store_key, &value, ttl);
        }
        Ok(value)
      })
      .await?;

    decode(value)
  }

  /// POST `body` to `endpoint`.
  pub async fn create<T, B>(
    &self,
    endpoint: &str,
    body: &B,
    _options: &RequestOptions,
  ) -> Result<T, FetchError>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    self.mutate(Method::Post, endpoint, Some(to_body(body)?)).await
  }

  /// PUT `body` to `endpoint`.
  pub async fn replace<T, B>(
    &self,
    endpoint: &str,
    body: &B,
    _options: &RequestOptions,
  ) -> Result<T, FetchError>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    self.mutate(Method::Put, endpoint, Some(to_body(body)?)).await
  }

  /// DELETE `endpoint`.
  pub async fn remove<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    _options: &RequestOptions,
  ) -> Result<T, FetchError> {
    self.mutate(Method::Delete, endpoint, None).await
  }

  /// Drop the cached read for `endpoint`.
  pub fn invalidate(&self, endpoint: &str, options: &RequestOptions) {
    let key = self.read_key(endpoint, options);
    debug!(endpoint, key = %key, "Invalidating cached read");
    self.store.remove(key.as_str());
  }

  /// Drop every cached read.
  pub fn invalidate_all(&self) {
    self.store.clear();
  }

  /// The live cached entry for `endpoint`, if any.
  pub fn cached_entry(
    &self,
    endpoint: &str,
    options: &RequestOptions,
  ) -> Option<CacheEntry<Value>> {
    self.store.get_entry(self.read_key(endpoint, options).as_str())
  }

  async fn mutate<T: DeserializeOwned>(
    &self,
    method: Method,
    endpoint: &str,
    body: Option<Value>,
  ) -> Result<T, FetchError> {
    let mut request = ApiRequest::new(method, endpoint);
    request.body = body;

    debug!(method = %method, endpoint, "Sending mutation");
    decode(send_json(self.transport.as_ref(), request).await?)
  }
}

/// Send `request` and classify the response.
async fn send_json(transport: &dyn Transport, request: ApiRequest) -> Result<Value, FetchError> {
  let response = transport.send(request).await?;

  if !response.is_success() {
    return Err(FetchError::Status {
      status: response.status,
      body: response.body,
    });
  }

  if response.body.trim().is_empty() {
    return Ok(Value::Null);
  }

  serde_json::from_str(&response.body).map_err(|e| FetchError::Malformed(e.to_string()))
}

fn decodes_as<T: DeserializeOwned>(value: &Value) -> Result<(), FetchError> {
  T::deserialize(value)
    .map(|_| ())
    .map_err(|e| FetchError::Malformed(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, FetchError> {
  serde_json::from_value(value).map_err(|e| FetchError::Malformed(e.to_string()))
}

fn to_body<B: Serialize + ?Sized>(body: &B) -> Result<Value, FetchError> {
  serde_json::to_value(body).map_err(|e| FetchError::InvalidRequest(e.to_string()))
}
