//! Live network access for the interception layer.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use fsmonitor_common::{Error, Result};

use crate::http::{Request, Response};

/// Performs requests against the network.
///
/// HTTP error statuses are returned as responses; only failures to get a
/// response at all are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Get the fetcher name (e.g., "http").
    fn name(&self) -> &str;

    /// Perform `request`.
    ///
    /// # Errors
    /// - `Network` when no response was received
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// [`Fetcher`] backed by reqwest.
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("fsmonitor/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to fetch {}: {}", request.url, e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("Failed to read {}: {}", request.url, e)))?;

        Ok(Response::new(status, headers, body))
    }
}
