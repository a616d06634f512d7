//! Async query abstraction for view-level data fetching.
//!
//! Inspired by TanStack Query. A [`QueryClient`] keeps an in-memory cache of
//! query results and uses the durable [`ExpiringStore`] as a slower second
//! tier, so a result survives a restart without a network round trip while
//! it is still retained. [`Query<T>`] is the per-call-site handle that turns
//! a fetch into a value/loading/error state for rendering.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let mut query = Query::new(
//!   query_client.clone(),
//!   QueryKey::new(["stats", 42]),
//!   move || {
//!     let api = api.clone();
//!     async move { api.read::<Stats>("/api/users/42/stats", &RequestOptions::new()).await }
//!   },
//! );
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!   // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.state() {
//!   QueryState::Loading => render_spinner(),
//!   QueryState::Success(data) => render_data(data),
//!   QueryState::Error(e) => render_error(e),
//!   QueryState::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::{CacheKey, Method, DEFAULT_COALESCE_WINDOW};
use crate::cache::lock::mutex_lock;
use crate::cache::{Coalescer, ExpiringStore};
use crate::clock::{self, Clock};
use crate::error::FetchError;

const SOURCE: &str = "query";

/// Pseudo-endpoint under which query identities derive their store keys.
pub const QUERY_ENDPOINT: &str = "query";

/// Identity of a query, e.g. `["stats", 42]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
  pub fn new<I, V>(parts: I) -> Self
  where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Store key for this query, derived the same way as request keys.
  pub fn cache_key(&self) -> CacheKey {
    CacheKey::derive(Method::Get, QUERY_ENDPOINT, Some(&Value::Array(self.0.clone())))
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", Value::Array(self.0.clone()))
  }
}

/// Freshness and retry policy for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  /// A value younger than this is returned without running the read
  pub fresh_for: Duration,
  /// A value older than this is discarded from both tiers
  pub retain_for: Duration,
  /// Extra attempts after a failed read
  pub retry: u32,
  /// Fixed pause between attempts
  pub retry_delay: Duration,
  /// Refetch stale data when the host regains focus
  pub refetch_on_focus: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      fresh_for: Duration::from_secs(60),
      retain_for: Duration::from_secs(600),
      retry: 1,
      retry_delay: Duration::from_millis(500),
      // Focus refetch is a frequent source of redundant traffic
      refetch_on_focus: false,
    }
  }
}

impl QueryOptions {
  pub fn with_fresh_for(mut self, fresh_for: Duration) -> Self {
    self.fresh_for = fresh_for;
    self
  }

  pub fn with_retain_for(mut self, retain_for: Duration) -> Self {
    self.retain_for = retain_for;
    self
  }

  pub fn with_retry(mut self, retry: u32, delay: Duration) -> Self {
    self.retry = retry;
    self.retry_delay = delay;
    self
  }

  pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
    self.refetch_on_focus = enabled;
    self
  }
}

/// Which tier produced a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
  /// In-memory value inside its fresh window
  MemoryFresh,
  /// In-memory value past its fresh window but still retained
  MemoryStale,
  /// Value recovered from the durable store
  Durable,
  /// Fresh data from the read operation
  Network,
}

/// Result of [`QueryClient::fetch_query`].
#[derive(Debug)]
pub struct QueryResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: QuerySource,
  /// When the data was produced by a read
  pub updated_at: DateTime<Utc>,
  /// Background refresh started because the data was not fresh
  pub refresh: Option<JoinHandle<Result<T, FetchError>>>,
}

impl<T> QueryResult<T> {
  pub fn is_stale(&self) -> bool {
    self.refresh.is_some()
  }
}

struct MemoryEntry {
  value: Value,
  updated_at: i64,
  retain_until: i64,
}

/// Shared two-tier query cache.
///
/// Cheap to clone; clones share the same in-memory cache and in-flight reads.
#[derive(Clone)]
pub struct QueryClient {
  store: ExpiringStore,
  clock: Arc<dyn Clock>,
  entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
  coalescer: Coalescer<Value>,
  coalesce_window: Duration,
  defaults: QueryOptions,
}

impl QueryClient {
  /// Create a query client whose durable tier is `store`.
  pub fn new(store: ExpiringStore) -> Self {
    let clock = Arc::clone(store.clock());
    Self {
      coalescer: Coalescer::with_clock(Arc::clone(&clock)),
      store,
      clock,
      entries: Arc::new(Mutex::new(HashMap::new())),
      coalesce_window: DEFAULT_COALESCE_WINDOW,
      defaults: QueryOptions::default(),
    }
  }

  /// Options used by [`Query::new`].
  pub fn with_defaults(mut self, defaults: QueryOptions) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn with_coalesce_window(mut self, window: Duration) -> Self {
    self.coalesce_window = window;
    self
  }

  pub fn defaults(&self) -> QueryOptions {
    self.defaults
  }

  /// Resolve `key` from the cheapest tier that has it.
  ///
  /// 1. In-memory value inside its fresh window: returned as is
  /// 2. Durable value: seeded into memory and returned; refreshed in
  ///    background once it is past the fresh window
  /// 3. Retained in-memory value: returned, refreshed in background
  /// 4. Nothing usable: `fetcher` runs (with retries) and fills both tiers
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: &QueryOptions,
    fetcher: F,
  ) -> Result<QueryResult<T>, FetchError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let id = key.cache_key();
    let now = self.clock.now_ms();
    let memory = self.memory_lookup(id.as_str(), now);

    if let Some((value, updated_at)) = &memory {
      if now < clock::deadline(*updated_at, options.fresh_for) {
        if let Ok(data) = T::deserialize(value) {
          debug!(query = %key, "Query served from memory");
          return Ok(QueryResult {
            data,
            source: QuerySource::MemoryFresh,
            updated_at: clock::to_datetime(*updated_at),
            refresh: None,
          });
        }
      }
    }

    if let Some(entry) = self.store.get_entry::<Value>(id.as_str()) {
      if let Ok(data) = T::deserialize(&entry.data) {
        debug!(query = %key, "Query seeded from durable store");
        let fresh = now < clock::deadline(entry.stored_at, options.fresh_for);
        self.seed(id.as_str(), entry.data, entry.stored_at, entry.expires_at);
        let refresh = if fresh {
          None
        } else {
          Some(self.spawn_refresh(key.clone(), *options, fetcher))
        };
        return Ok(QueryResult {
          data,
          source: QuerySource::Durable,
          updated_at: clock::to_datetime(entry.stored_at),
          refresh,
        });
      }
    }

    if let Some((value, updated_at)) = memory {
      if let Ok(data) = T::deserialize(&value) {
        debug!(query = %key, "Query served stale from memory");
        return Ok(QueryResult {
          data,
          source: QuerySource::MemoryStale,
          updated_at: clock::to_datetime(updated_at),
          refresh: Some(self.spawn_refresh(key.clone(), *options, fetcher)),
        });
      }
    }

    debug!(query = %key, "Query miss, running read");
    let data = self.run_read(key, *options, fetcher).await?;
    Ok(QueryResult {
      data,
      source: QuerySource::Network,
      updated_at: clock::to_datetime(self.clock.now_ms()),
      refresh: None,
    })
  }

  /// Run the read for `key` regardless of what either tier holds.
  pub async fn refetch_query<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: &QueryOptions,
    fetcher: F,
  ) -> Result<QueryResult<T>, FetchError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let data = self.run_read(key, *options, fetcher).await?;
    Ok(QueryResult {
      data,
      source: QuerySource::Network,
      updated_at: clock::to_datetime(self.clock.now_ms()),
      refresh: None,
    })
  }

  /// Cached value for `key` from either tier, without running anything.
  pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    let id = key.cache_key();
    if let Some((value, _)) = self.memory_lookup(id.as_str(), self.clock.now_ms()) {
      if let Ok(data) = T::deserialize(&value) {
        return Some(data);
      }
    }
    self.store.get(id.as_str())
  }

  /// Write `data` for `key` into both tiers as if a read had just returned it.
  pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T, options: &QueryOptions) {
    match serde_json::to_value(data) {
      Ok(value) => self.populate(key.cache_key().as_str(), value, options),
      Err(e) => warn!(query = %key, error = %e, "Skipping query data that cannot be serialized"),
    }
  }

  /// Drop `key` from both tiers.
  pub fn invalidate_query(&self, key: &QueryKey) {
    let id = key.cache_key();
    mutex_lock(&self.entries, SOURCE, "invalidate_query").remove(id.as_str());
    self.store.remove(id.as_str());
    debug!(query = %key, "Invalidated query");
  }

  /// Discard in-memory values past their retained window. Returns how many were dropped.
  pub fn collect_garbage(&self) -> usize {
    let now = self.clock.now_ms();
    let mut entries = mutex_lock(&self.entries, SOURCE, "collect_garbage");
    let before = entries.len();
    entries.retain(|_, entry| now < entry.retain_until);
    let dropped = before - entries.len();
    if dropped > 0 {
      debug!(dropped, "Discarded expired query results");
    }
    dropped
  }

  /// Run [`collect_garbage`](Self::collect_garbage) every `interval`.
  pub fn spawn_gc(&self, interval: Duration) -> JoinHandle<()> {
    let client = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        client.collect_garbage();
      }
    })
  }

  /// Number of values held in memory, including ones not yet collected.
  pub fn memory_len(&self) -> usize {
    mutex_lock(&self.entries, SOURCE, "memory_len").len()
  }

  fn memory_lookup(&self, id: &str, now: i64) -> Option<(Value, i64)> {
    let mut entries = mutex_lock(&self.entries, SOURCE, "memory_lookup");
    match entries.get(id) {
      Some(entry) if now < entry.retain_until => Some((entry.value.clone(), entry.updated_at)),
      Some(_) => {
        entries.remove(id);
        None
      }
      None => None,
    }
  }

  fn seed(&self, id: &str, value: Value, updated_at: i64, retain_until: i64) {
    mutex_lock(&self.entries, SOURCE, "seed").insert(
      id.to_string(),
      MemoryEntry {
        value,
        updated_at,
        retain_until,
      },
    );
  }

  fn populate(&self, id: &str, value: Value, options: &QueryOptions) {
    let now = self.clock.now_ms();
    if !options.retain_for.is_zero() {
      self.store.set(id, &value, options.retain_for);
    }
    self.seed(id, value, now, clock::deadline(now, options.retain_for));
  }

  fn spawn_refresh<T, F, Fut>(
    &self,
    key: QueryKey,
    options: QueryOptions,
    fetcher: F,
  ) -> JoinHandle<Result<T, FetchError>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let client = self.clone();
    tokio::spawn(async move {
      let outcome = client.run_read(&key, options, fetcher).await;
      if let Err(e) = &outcome {
        warn!(query = %key, error = %e, "Background refresh failed, keeping cached value");
      }
      outcome
    })
  }

  /// Run `fetcher` with retries, coalesced per query, and fill both tiers on success.
  async fn run_read<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: QueryOptions,
    fetcher: F,
  ) -> Result<T, FetchError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let id = key.cache_key().as_str().to_string();
    let client = self.clone();
    let label = key.to_string();
    let store_key = id.clone();

    let value = self
      .coalescer
      .run(&id, self.coalesce_window, move || async move {
        let data = with_retries(&label, &options, &fetcher).await?;
        let value =
          serde_json::to_value(&data).map_err(|e| FetchError::Malformed(e.to_string()))?;
        client.populate(&store_key, value.clone(), &options);
        Ok(value)
      })
      .await?;

    serde_json::from_value(value).map_err(|e| FetchError::Malformed(e.to_string()))
  }
}

/// Run `fetcher` up to `1 + options.retry` times with a fixed delay between attempts.
async fn with_retries<T, F, Fut>(
  label: &str,
  options: &QueryOptions,
  fetcher: &F,
) -> Result<T, FetchError>
where
  F: Fn() -> Fut,
  Fut: Future<Output = Result<T, FetchError>>,
{
  let mut attempt = 0;
  loop {
    match fetcher().await {
      Ok(data) => return Ok(data),
      Err(e) if attempt < options.retry => {
        attempt += 1;
        debug!(query = label, attempt, error = %e, "Query read failed, retrying");
        tokio::time::sleep(options.retry_delay).await;
      }
      Err(e) => return Err(e),
    }
  }
}

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is fetching and has no data yet
  Loading,
  /// Query has data
  Success(T),
  /// Query failed with an error
  Error(FetchError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&FetchError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A boxed future that returns a Result<T, FetchError>
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;

enum QueryMessage<T> {
  Settled {
    data: T,
    source: QuerySource,
    updated_at: DateTime<Utc>,
    refreshing: bool,
  },
  Refreshed(Result<T, FetchError>),
  Failed(FetchError),
}

/// Per-call-site query handle with state management.
///
/// Query<T> encapsulates:
/// - The fetching logic (via a closure)
/// - Loading/success/error states, plus whether a background refresh runs
/// - Async result handling via channels
/// - Staleness according to the query's fresh window
pub struct Query<T> {
  client: QueryClient,
  key: QueryKey,
  options: QueryOptions,
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<QueryMessage<T>>>,
  fetched_at: Option<DateTime<Utc>>,
  source: Option<QuerySource>,
  is_fetching: bool,
  refresh_error: Option<FetchError>,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Create a new query with the given fetcher function.
  ///
  /// The fetcher is a closure that returns a future. It runs whenever
  /// neither cache tier can answer, and for background refreshes.
  pub fn new<F, Fut>(client: QueryClient, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let options = client.defaults();
    Self {
      client,
      key,
      options,
      state: QueryState::Idle,
      fetcher: Arc::new(move || -> BoxFuture<T> { Box::pin(fetcher()) }),
      receiver: None,
      fetched_at: None,
      source: None,
      is_fetching: false,
      refresh_error: None,
    }
  }

  /// Override the client's default options for this query.
  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the data if the query has any.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  /// Check if the query is loading without data.
  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  /// Check if a read is running, including a background refresh.
  pub fn is_fetching(&self) -> bool {
    self.is_loading() || self.is_fetching
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  /// Get the error if the query failed.
  pub fn error(&self) -> Option<&FetchError> {
    self.state.error()
  }

  /// Error of the last background refresh, if it failed. The data is kept.
  pub fn refresh_error(&self) -> Option<&FetchError> {
    self.refresh_error.as_ref()
  }

  /// Tier that produced the current data.
  pub fn source(&self) -> Option<QuerySource> {
    self.source
  }

  /// Check if the data is older than the fresh window.
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| {
          let fresh_until = clock::deadline(t.timestamp_millis(), self.options.fresh_for);
          self.client.clock.now_ms() >= fresh_until
        })
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching data if not already fetching.
  ///
  /// This is a no-op if a read is already running.
  pub fn fetch(&mut self) {
    if self.is_fetching() {
      return;
    }
    self.start_fetch(false);
  }

  /// Force a read that bypasses both cache tiers.
  pub fn refetch(&mut self) {
    // Stop listening to any pending fetch by dropping the receiver
    self.receiver = None;
    self.is_fetching = false;
    self.start_fetch(true);
  }

  /// Host window regained focus. Refetches only when enabled for this query.
  ///
  /// Returns `true` if a fetch was started.
  pub fn on_focus(&mut self) -> bool {
    if !self.options.refetch_on_focus || !self.is_stale() || self.is_fetching() {
      return false;
    }
    self.start_fetch(false);
    true
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    loop {
      let receiver = match &mut self.receiver {
        Some(rx) => rx,
        None => return changed,
      };

      // Try to receive without blocking
      let message = match receiver.try_recv() {
        Ok(message) => message,
        Err(mpsc::error::TryRecvError::Empty) => return changed,
        Err(mpsc::error::TryRecvError::Disconnected) => {
          // Sender dropped without finishing
          if self.state.is_loading() {
            self.state = QueryState::Error(FetchError::Aborted("query was cancelled".to_string()));
          }
          self.is_fetching = false;
          self.receiver = None;
          return true;
        }
      };

      changed = true;
      match message {
        QueryMessage::Settled {
          data,
          source,
          updated_at,
          refreshing,
        } => {
          self.state = QueryState::Success(data);
          self.fetched_at = Some(updated_at);
          self.source = Some(source);
          self.is_fetching = refreshing;
          self.refresh_error = None;
          if !refreshing {
            self.receiver = None;
          }
        }
        QueryMessage::Refreshed(Ok(data)) => {
          self.state = QueryState::Success(data);
          self.fetched_at = Some(clock::to_datetime(self.client.clock.now_ms()));
          self.source = Some(QuerySource::Network);
          self.is_fetching = false;
          self.receiver = None;
        }
        QueryMessage::Refreshed(Err(error)) => {
          self.refresh_error = Some(error);
          self.is_fetching = false;
          self.receiver = None;
        }
        QueryMessage::Failed(error) => {
          // Keep data from an earlier success; only a first load turns into an error
          if self.state.is_success() {
            self.refresh_error = Some(error);
          } else {
            self.state = QueryState::Error(error);
          }
          self.is_fetching = false;
          self.receiver = None;
        }
      }
    }
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if self.state.is_success() {
      self.is_fetching = true;
    } else {
      self.state = QueryState::Loading;
    }

    let client = self.client.clone();
    let key = self.key.clone();
    let options = self.options;
    let fetcher = Arc::clone(&self.fetcher);

    tokio::spawn(async move {
      let run = move || fetcher();
      let outcome = if force {
        client.refetch_query(&key, &options, run).await
      } else {
        client.fetch_query(&key, &options, run).await
      };

      // Ignore send errors - receiver may have been dropped
      match outcome {
        Ok(result) => {
          let refreshing = result.refresh.is_some();
          let sent = tx.send(QueryMessage::Settled {
            data: result.data,
            source: result.source,
            updated_at: result.updated_at,
            refreshing,
          });
          if let (Ok(()), Some(handle)) = (sent, result.refresh) {
            let refreshed = match handle.await {
              Ok(outcome) => outcome,
              Err(e) => Err(FetchError::Aborted(e.to_string())),
            };
            let _ = tx.send(QueryMessage::Refreshed(refreshed));
          }
        }
        Err(error) => {
          let _ = tx.send(QueryMessage::Failed(error));
        }
      }
    });
  }
}

// Query is not Clone because the receiver is owned.
// If you need to share a query, wrap it in Arc<Mutex<Query<T>>>.

impl<T: fmt::Debug> fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("source", &self.source)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
