//! Routing of outbound GET traffic through the response caches.
//!
//! - API routes: network first, allow-listed responses cached, cached or
//!   offline JSON on network failure
//! - Page loads: network first, cached page or offline page on failure
//! - Static assets: cache first
//!
//! Non-GET requests go straight to the network and are never cached.

use futures::future::try_join_all;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use fsmonitor_common::{Error, Result};

use crate::cache::CacheStorage;
use crate::fetcher::Fetcher;
use crate::http::{Request, RequestMode, Response};

/// Interception settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Cache names are `<prefix>-v<version>` and `<prefix>-api-v<version>`.
    pub cache_prefix: String,
    pub version: u32,
    /// Path prefixes handled as API traffic.
    pub api_prefixes: Vec<String>,
    /// API paths whose successful responses are cached (substring match).
    pub cacheable_api_routes: Vec<String>,
    /// Paths pre-cached by `install`.
    pub static_assets: Vec<String>,
    pub offline_page: String,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "fs-monitoring".to_string(),
            version: 3,
            api_prefixes: vec!["/hygiene-checklist/api/".to_string(), "/api/".to_string()],
            cacheable_api_routes: vec![
                "/hygiene-checklist/api/employees".to_string(),
                "/hygiene-checklist/api/checklist-items".to_string(),
                "/hygiene-checklist/api/settings".to_string(),
                "/hygiene-checklist/api/me".to_string(),
            ],
            static_assets: vec!["/offline.html".to_string(), "/manifest.json".to_string()],
            offline_page: "/offline.html".to_string(),
        }
    }
}

impl InterceptConfig {
    pub fn static_cache_name(&self) -> String {
        format!("{}-v{}", self.cache_prefix, self.version)
    }

    pub fn api_cache_name(&self) -> String {
        format!("{}-api-v{}", self.cache_prefix, self.version)
    }
}

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    PassThrough,
    Api,
    Page,
    Static,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflinePage,
    /// Built locally because nothing else was available.
    Synthesized,
}

/// A response together with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Intercepted {
    pub response: Response,
    pub source: ResponseSource,
}

impl Intercepted {
    fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }
}

/// Request interception layer.
pub struct Interceptor {
    config: InterceptConfig,
    origin: Url,
    caches: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl Interceptor {
    /// Create an interceptor for the site at `origin`.
    pub fn new(config: InterceptConfig, origin: Url, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            origin,
            caches: Arc::new(CacheStorage::new()),
            fetcher,
        }
    }

    /// Use `caches` instead of process-local caches.
    pub fn with_caches(mut self, caches: Arc<CacheStorage>) -> Self {
        self.caches = caches;
        self
    }

    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<CacheStorage> {
        &self.caches
    }

    fn site_request(&self, path: &str) -> Result<Request> {
        let url = self
            .origin
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid path '{}': {}", path, e)))?;
        Ok(Request::new(Method::GET, url))
    }

    async fn precache_entry(&self, asset: &str) -> Result<(String, Response)> {
        let request = self.site_request(asset)?;
        let response = self.fetcher.fetch(&request).await?;
        if !response.is_success() {
            return Err(Error::Delivery(format!(
                "Failed to pre-cache {}: server returned {}",
                asset,
                response.status.as_u16()
            )));
        }
        Ok((request.cache_key(), response))
    }

    /// Pre-cache the static assets into the current static cache.
    ///
    /// Nothing is stored unless every asset was fetched successfully.
    pub async fn install(&self) -> Result<usize> {
        info!("Installing offline caches");
        let fetches = self
            .config
            .static_assets
            .iter()
            .map(|asset| self.precache_entry(asset));
        let entries = try_join_all(fetches).await?;

        let count = entries.len();
        self.caches
            .put_all(&self.config.static_cache_name(), entries)
            .await?;
        info!("Cached {} static assets", count);
        Ok(count)
    }

    /// Delete every cache that is not a current generation.
    ///
    /// # Returns
    /// Names of the deleted caches.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let keep = [
            self.config.static_cache_name(),
            self.config.api_cache_name(),
        ];
        let mut deleted = Vec::new();
        for name in self.caches.keys().await? {
            if !keep.contains(&name) && self.caches.delete(&name).await? {
                info!("Deleted stale cache {}", name);
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Cache a live response. A failed write only costs offline coverage.
    async fn cache_response(&self, cache: &str, request: &Request, response: &Response) {
        match self.caches.put(cache, request, response.clone()).await {
            Ok(()) => debug!("Cached {} in {}", request.path(), cache),
            Err(e) => warn!("Failed to cache {}: {}", request.path(), e),
        }
    }

    /// Look `request` up in every cache; lookup failures count as a miss.
    async fn cached(&self, request: &Request) -> Option<Response> {
        match self.caches.match_any(request).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache lookup for {} failed: {}", request.path(), e);
                None
            }
        }
    }

    /// Classify a request.
    pub fn route(&self, request: &Request) -> Route {
        if request.method != Method::GET {
            return Route::PassThrough;
        }
        let path = request.path();
        if self
            .config
            .api_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            Route::Api
        } else if request.is_page_load() {
            Route::Page
        } else {
            Route::Static
        }
    }

    /// Answer a request.
    ///
    /// # Errors
    /// - Network failure of a pass-through request
    /// - Network failure of an uncached static asset outside a navigation
    pub async fn handle(&self, request: &Request) -> Result<Intercepted> {
        match self.route(request) {
            Route::PassThrough => {
                let response = self.fetcher.fetch(request).await?;
                Ok(Intercepted::new(response, ResponseSource::Network))
            }
            Route::Api => Ok(self.handle_api(request).await),
            Route::Page => Ok(self.handle_page(request).await),
            Route::Static => self.handle_static(request).await,
        }
    }

    fn is_cacheable_api(&self, path: &str) -> bool {
        self.config
            .cacheable_api_routes
            .iter()
            .any(|route| path.contains(route.as_str()))
    }

    async fn handle_api(&self, request: &Request) -> Intercepted {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() && self.is_cacheable_api(request.path()) {
                    self.cache_response(&self.config.api_cache_name(), request, &response)
                        .await;
                }
                Intercepted::new(response, ResponseSource::Network)
            }
            Err(e) => {
                debug!("API fetch failed ({}), trying cache", e);
                if let Some(cached) = self.cached(request).await {
                    debug!("Serving API from cache: {}", request.path());
                    return Intercepted::new(cached, ResponseSource::Cache);
                }
                Intercepted::new(
                    Response::json(
                        StatusCode::OK,
                        &json!({ "offline": true, "message": "You are offline" }),
                    ),
                    ResponseSource::Synthesized,
                )
            }
        }
    }

    async fn handle_page(&self, request: &Request) -> Intercepted {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.cache_response(&self.config.static_cache_name(), request, &response)
                        .await;
                }
                Intercepted::new(response, ResponseSource::Network)
            }
            Err(e) => {
                debug!("Page fetch failed ({}), trying cache", e);
                if let Some(cached) = self.cached(request).await {
                    debug!("Serving page from cache: {}", request.path());
                    return Intercepted::new(cached, ResponseSource::Cache);
                }
                debug!("No cache for {}, showing offline page", request.path());
                self.offline_fallback().await
            }
        }
    }

    async fn handle_static(&self, request: &Request) -> Result<Intercepted> {
        if let Some(cached) = self.cached(request).await {
            return Ok(Intercepted::new(cached, ResponseSource::Cache));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.cache_response(&self.config.static_cache_name(), request, &response)
                        .await;
                }
                Ok(Intercepted::new(response, ResponseSource::Network))
            }
            Err(_) if request.mode == RequestMode::Navigate => Ok(self.offline_fallback().await),
            Err(e) => Err(e),
        }
    }

    async fn offline_fallback(&self) -> Intercepted {
        if let Ok(request) = self.site_request(&self.config.offline_page) {
            if let Some(page) = self.cached(&request).await {
                return Intercepted::new(page, ResponseSource::OfflinePage);
            }
        }
        Intercepted::new(
            Response::with_content_type(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/html; charset=utf-8",
                "<!DOCTYPE html><title>Offline</title><h1>You are offline</h1>",
            ),
            ResponseSource::Synthesized,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::header::{HeaderMap, HeaderValue, ETAG};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeNetwork {
        routes: Mutex<HashMap<String, Response>>,
        down: AtomicBool,
        fetches: AtomicUsize,
    }

    impl FakeNetwork {
        fn serve(&self, path: &str, response: Response) {
            self.routes
                .lock()
                .unwrap()
                .insert(format!("http://localhost{}", path), response);
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeNetwork {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch(&self, request: &Request) -> Result<Response> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::Network("Connection refused".to_string()));
            }
            let routes = self.routes.lock().unwrap();
            Ok(routes.get(request.url.as_str()).cloned().unwrap_or_else(|| {
                Response::with_content_type(StatusCode::NOT_FOUND, "text/plain", "not found")
            }))
        }
    }

    fn setup() -> (Arc<FakeNetwork>, Interceptor) {
        let network = Arc::new(FakeNetwork::default());
        network.serve(
            "/offline.html",
            Response::with_content_type(StatusCode::OK, "text/html", "<h1>Offline</h1>"),
        );
        network.serve(
            "/manifest.json",
            Response::with_content_type(StatusCode::OK, "application/json", "{}"),
        );
        let interceptor = Interceptor::new(
            InterceptConfig::default(),
            Url::parse("http://localhost").unwrap(),
            network.clone(),
        );
        (network, interceptor)
    }

    fn get(path: &str) -> Request {
        Request::get(&format!("http://localhost{}", path)).unwrap()
    }

    #[tokio::test]
    async fn test_cached_api_response_served_byte_for_byte() {
        let (network, interceptor) = setup();
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"v7\""));
        let live = Response::new(StatusCode::OK, headers, r#"[{"id":1,"name":"Ana"}]"#);
        network.serve("/hygiene-checklist/api/employees", live.clone());

        let request = get("/hygiene-checklist/api/employees");
        let first = interceptor.handle(&request).await.unwrap();
        assert_eq!(first.source, ResponseSource::Network);

        network.set_down(true);
        let second = interceptor.handle(&request).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.response, live);
    }

    #[tokio::test]
    async fn test_uncacheable_api_falls_back_to_offline_json() {
        let (network, interceptor) = setup();
        network.serve(
            "/api/auditor/stores",
            Response::json(StatusCode::OK, &json!([{"id": 1}])),
        );
        let request = get("/api/auditor/stores");
        interceptor.handle(&request).await.unwrap();

        network.set_down(true);
        let offline = interceptor.handle(&request).await.unwrap();
        assert_eq!(offline.source, ResponseSource::Synthesized);
        let body: serde_json::Value = serde_json::from_slice(&offline.response.body).unwrap();
        assert_eq!(body, json!({"offline": true, "message": "You are offline"}));
    }

    #[tokio::test]
    async fn test_http_errors_are_not_cached_or_replaced() {
        let (network, interceptor) = setup();
        let request = get("/hygiene-checklist/api/settings");
        network.serve(
            "/hygiene-checklist/api/settings",
            Response::json(StatusCode::OK, &json!({"k": 1})),
        );
        interceptor.handle(&request).await.unwrap();

        network.serve(
            "/hygiene-checklist/api/settings",
            Response::json(StatusCode::INTERNAL_SERVER_ERROR, &json!({})),
        );
        let answer = interceptor.handle(&request).await.unwrap();
        assert_eq!(answer.response.status, StatusCode::INTERNAL_SERVER_ERROR);

        network.set_down(true);
        let cached = interceptor.handle(&request).await.unwrap();
        assert_eq!(cached.response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_page_fallback_chain() {
        let (network, interceptor) = setup();
        network.serve(
            "/dashboard",
            Response::with_content_type(StatusCode::OK, "text/html", "<h1>Dashboard</h1>"),
        );
        let dashboard = Request::navigate("http://localhost/dashboard").unwrap();
        let unknown = Request::navigate("http://localhost/hygiene-checklist/history").unwrap();

        interceptor.handle(&dashboard).await.unwrap();
        network.set_down(true);

        let cached = interceptor.handle(&dashboard).await.unwrap();
        assert_eq!(cached.source, ResponseSource::Cache);
        assert_eq!(&cached.response.body[..], b"<h1>Dashboard</h1>");

        let synthesized = interceptor.handle(&unknown).await.unwrap();
        assert_eq!(synthesized.source, ResponseSource::Synthesized);
        assert_eq!(synthesized.response.status, StatusCode::SERVICE_UNAVAILABLE);

        network.set_down(false);
        interceptor.install().await.unwrap();
        network.set_down(true);
        let offline = interceptor.handle(&unknown).await.unwrap();
        assert_eq!(offline.source, ResponseSource::OfflinePage);
        assert_eq!(&offline.response.body[..], b"<h1>Offline</h1>");
    }

    #[tokio::test]
    async fn test_static_assets_are_cache_first() {
        let (network, interceptor) = setup();
        assert_eq!(interceptor.install().await.unwrap(), 2);
        let fetches = network.fetches();

        let manifest = interceptor.handle(&get("/manifest.json")).await.unwrap();
        assert_eq!(manifest.source, ResponseSource::Cache);
        assert_eq!(network.fetches(), fetches);

        network.set_down(true);
        assert!(interceptor.handle(&get("/app.js")).await.is_err());
    }

    #[tokio::test]
    async fn test_non_get_passes_through_uncached() {
        let (network, interceptor) = setup();
        network.serve(
            "/api/auditor/submit-audit",
            Response::json(StatusCode::OK, &json!({"id": 5})),
        );
        let post = Request::new(
            Method::POST,
            Url::parse("http://localhost/api/auditor/submit-audit").unwrap(),
        )
        .with_body(r#"{"storeId":1}"#);

        assert_eq!(interceptor.route(&post), Route::PassThrough);
        interceptor.handle(&post).await.unwrap();
        assert!(interceptor.caches().keys().await.unwrap().is_empty());

        network.set_down(true);
        assert!(interceptor.handle(&post).await.is_err());
    }

    #[tokio::test]
    async fn test_install_fails_on_missing_asset() {
        let (network, interceptor) = setup();
        network.routes.lock().unwrap().clear();
        assert!(interceptor.install().await.is_err());
        assert_eq!(interceptor.caches().len("fs-monitoring-v3").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_activate_drops_old_generations() {
        let (_network, interceptor) = setup();
        interceptor.caches().open("fs-monitoring-v2").await.unwrap();
        interceptor.caches().open("fs-monitoring-api-v2").await.unwrap();
        interceptor.install().await.unwrap();
        interceptor.caches().open("fs-monitoring-api-v3").await.unwrap();

        let mut deleted = interceptor.activate().await.unwrap();
        deleted.sort();
        assert_eq!(deleted, vec!["fs-monitoring-api-v2", "fs-monitoring-v2"]);
        assert_eq!(
            interceptor.caches().keys().await.unwrap(),
            vec!["fs-monitoring-v3".to_string(), "fs-monitoring-api-v3".to_string()]
        );
    }
}
