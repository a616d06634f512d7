//! Network boundary: one HTTP request per operation against a base URL.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::FetchError;

use super::key::Method;

/// A single request against the configured API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  /// Path relative to the base URL, query string included
  pub endpoint: String,
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
    Self {
      method,
      endpoint: endpoint.into(),
      body: None,
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// Raw response as received; the client decides what counts as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
  pub status: u16,
  pub body: String,
}

impl ApiResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Something that can carry an [`ApiRequest`] to the server.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Send the request. Errors here are transport faults only; any response,
  /// whatever its status, is returned as `Ok`.
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, FetchError>;
}

/// HTTP transport backed by reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
  timeout: Duration,
}

impl ReqwestTransport {
  /// Create a transport for `base_url`, authenticating with `token` when given.
  pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, FetchError> {
    let mut base_url = Url::parse(base_url)
      .map_err(|e| FetchError::InvalidRequest(format!("invalid base URL {}: {}", base_url, e)))?;
    // Endpoints join under the base path, so it has to end in a slash
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token,
      timeout,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve `endpoint` under the base path. A leading slash does not reset
  /// the path to the host root.
  fn url_for(&self, endpoint: &str) -> Result<Url, FetchError> {
    self
      .base_url
      .join(endpoint.trim_start_matches('/'))
      .map_err(|e| FetchError::InvalidRequest(format!("invalid endpoint {}: {}", endpoint, e)))
  }

  fn classify(&self, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
      FetchError::Timeout(self.timeout)
    } else {
      FetchError::Transport(error.to_string())
    }
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, FetchError> {
    let url = self.url_for(&request.endpoint)?;

    let mut builder = match request.method {
      Method::Get => self.client.get(url),
      Method::Post => self.client.post(url),
      Method::Put => self.client.put(url),
      Method::Delete => self.client.delete(url),
    };

    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    debug!(method = %request.method, endpoint = %request.endpoint, "Sending request");

    let response = builder.send().await.map_err(|e| self.classify(e))?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| self.classify(e))?;

    debug!(method = %request.method, endpoint = %request.endpoint, status, "Received response");

    Ok(ApiResponse { status, body })
  }
}
