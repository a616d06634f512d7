use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::api::TtlPolicy;
use crate::cache::DEFAULT_NAMESPACE;
use crate::query::QueryOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub query: QueryConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin every endpoint is resolved against
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Prefix for every key written to storage
  #[serde(default = "default_namespace")]
  pub namespace: String,
  /// SQLite file (defaults to $XDG_DATA_HOME/apicache/cache.db)
  pub path: Option<PathBuf>,
  /// Total bytes the store may occupy before writes are rejected
  pub quota_bytes: Option<usize>,
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  #[serde(default = "default_coalesce_window_secs")]
  pub coalesce_window_secs: u64,
  /// Per-endpoint-prefix TTLs
  #[serde(default, deserialize_with = "deserialize_rules")]
  pub rules: Vec<TtlRuleConfig>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      namespace: default_namespace(),
      path: None,
      quota_bytes: None,
      default_ttl_secs: default_ttl_secs(),
      coalesce_window_secs: default_coalesce_window_secs(),
      rules: Vec::new(),
    }
  }
}

impl CacheConfig {
  pub fn ttl_policy(&self) -> TtlPolicy {
    self
      .rules
      .iter()
      .fold(TtlPolicy::new(Duration::from_secs(self.default_ttl_secs)), |policy, rule| {
        policy.with_rule(rule.prefix.clone(), Duration::from_secs(rule.ttl_secs))
      })
  }

  pub fn coalesce_window(&self) -> Duration {
    Duration::from_secs(self.coalesce_window_secs)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TtlRuleConfig {
  pub prefix: String,
  pub ttl_secs: u64,
}

/// Endpoint prefixes are matched against paths, so make them absolute.
fn deserialize_rules<'de, D>(deserializer: D) -> Result<Vec<TtlRuleConfig>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let rules: Vec<TtlRuleConfig> = Vec::deserialize(deserializer)?;
  Ok(
    rules
      .into_iter()
      .map(|rule| TtlRuleConfig {
        prefix: if rule.prefix.starts_with('/') {
          rule.prefix
        } else {
          format!("/{}", rule.prefix)
        },
        ttl_secs: rule.ttl_secs,
      })
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
  /// How long a value is reused without running the read at all
  #[serde(default = "default_fresh_secs")]
  pub fresh_secs: u64,
  /// How long a value stays available before it is discarded
  #[serde(default = "default_retain_secs")]
  pub retain_secs: u64,
  #[serde(default = "default_retry")]
  pub retry: u32,
  #[serde(default = "default_retry_delay_ms")]
  pub retry_delay_ms: u64,
  #[serde(default)]
  pub refetch_on_focus: bool,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      fresh_secs: default_fresh_secs(),
      retain_secs: default_retain_secs(),
      retry: default_retry(),
      retry_delay_ms: default_retry_delay_ms(),
      refetch_on_focus: false,
    }
  }
}

impl QueryConfig {
  pub fn options(&self) -> QueryOptions {
    QueryOptions {
      fresh_for: Duration::from_secs(self.fresh_secs),
      retain_for: Duration::from_secs(self.retain_secs),
      retry: self.retry,
      retry_delay: Duration::from_millis(self.retry_delay_ms),
      refetch_on_focus: self.refetch_on_focus,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive, overridden by APICACHE_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily-rolling log files here instead of stderr
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      dir: None,
    }
  }
}

fn default_base_url() -> String {
  "http://localhost:8080".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_namespace() -> String {
  DEFAULT_NAMESPACE.to_string()
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_coalesce_window_secs() -> u64 {
  10
}

fn default_fresh_secs() -> u64 {
  60
}

fn default_retain_secs() -> u64 {
  600
}

fn default_retry() -> u32 {
  1
}

fn default_retry_delay_ms() -> u64 {
  500
}

fn default_log_level() -> String {
  "warn".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./apicache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/apicache/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("apicache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("apicache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks APICACHE_TOKEN first, then API_TOKEN as fallback. Requests are
  /// sent unauthenticated when neither is set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("APICACHE_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .filter(|token| !token.is_empty())
  }
}
