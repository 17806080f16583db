//! Request interception for offline use.
//!
//! Sits between the client and the network for GET traffic: refreshes
//! named response caches on success and answers from them when the
//! network is unreachable.

pub mod cache;
pub mod fetcher;
pub mod http;
pub mod interceptor;

pub use cache::CacheStorage;
pub use fetcher::{Fetcher, HttpFetcher};
pub use http::{Request, RequestMode, Response};
pub use interceptor::{InterceptConfig, Intercepted, Interceptor, ResponseSource, Route};
