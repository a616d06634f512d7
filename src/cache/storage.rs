//! Storage backends: a synchronous, string-keyed key-value store.
//!
//! Backends are treated as unreliable. Any call may fail (quota exceeded,
//! file locked, database cleared by another process) and callers above this
//! module must never assume success.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Trait for durable key-value backends.
pub trait Storage: Send + Sync {
  /// Read the raw value stored under `key`.
  fn get_item(&self, key: &str) -> Result<Option<String>>;

  /// Write `value` under `key`, replacing any previous value.
  fn set_item(&self, key: &str, value: &str) -> Result<()>;

  /// Delete `key`. Deleting a missing key is not an error.
  fn remove_item(&self, key: &str) -> Result<()>;

  /// All keys currently stored, including ones owned by other users of the backend.
  fn keys(&self) -> Result<Vec<String>>;
}

/// Process-local storage, optionally bounded by a byte quota.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  items: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reject writes that would push the total key + value size past `bytes`.
  pub fn with_quota(mut self, bytes: usize) -> Self {
    self.quota_bytes = Some(bytes);
    self
  }
}

impl Storage for MemoryStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    let items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(items.get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(quota) = self.quota_bytes {
      let others: usize = items
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      let needed = others + key.len() + value.len();
      if needed > quota {
        return Err(eyre!(
          "Storage quota exceeded: {} bytes needed, {} allowed",
          needed,
          quota
        ));
      }
    }

    items.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    items.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(items.keys().cloned().collect())
  }
}

/// SQLite-based storage shared by every process that opens the same file.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  quota_bytes: Option<usize>,
}

/// Schema for the key-value table.
const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl SqliteStorage {
  /// Open (or create) the storage at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the storage at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Storage that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  /// Reject writes that would push the total key + value size past `bytes`.
  pub fn with_quota(mut self, bytes: usize) -> Self {
    self.quota_bytes = Some(bytes);
    self
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("apicache").join("cache.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    })
  }
}

impl Storage for SqliteStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache item: {}", e))
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(quota) = self.quota_bytes {
      let others: i64 = conn
        .query_row(
          "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) \
           FROM kv WHERE key != ?",
          params![key],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to measure cache size: {}", e))?;
      let needed = usize::try_from(others).unwrap_or(usize::MAX) + key.len() + value.len();
      if needed > quota {
        return Err(eyre!(
          "Storage quota exceeded: {} bytes needed, {} allowed",
          needed,
          quota
        ));
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store cache item: {}", e))?;

    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache item: {}", e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}
