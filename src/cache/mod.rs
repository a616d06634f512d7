//! Caching primitives shared by the API client and the query layer.
//!
//! This module provides:
//! - A storage boundary over unreliable key-value backends (SQLite, memory)
//! - An expiring store with namespacing and lazy TTL expiry
//! - A coalescer that deduplicates concurrent in-flight operations

mod coalesce;
pub(crate) mod lock;
mod storage;
mod store;
mod traits;

pub use coalesce::Coalescer;
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use store::{ExpiringStore, DEFAULT_NAMESPACE};
pub use traits::CacheEntry;
