//! Client-side data access with a durable expiring cache.
//!
//! - [`cache`]: storage boundary, expiring store and request coalescer
//! - [`api`]: the unified client every component reads and writes through
//! - [`query`]: two-tier query cache for view-level fetching

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod query;

pub use api::{ApiClient, CacheKey, Method, RequestOptions};
pub use cache::ExpiringStore;
pub use config::Config;
pub use error::FetchError;
pub use query::{Query, QueryClient, QueryKey, QueryOptions, QueryState};
