//! Data-access client for the remote API.

mod client;
mod key;
mod policy;
mod transport;

pub use client::{ApiClient, RequestOptions};
pub use key::{CacheKey, Method};
pub use policy::{TtlPolicy, TtlRule, DEFAULT_COALESCE_WINDOW, DEFAULT_TTL};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};

pub use crate::error::FetchError;
