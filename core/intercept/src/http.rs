//! Request and response values seen by the interception layer.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use url::Url;

use fsmonitor_common::{Error, Result};

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    #[default]
    Cors,
    NoCors,
    SameOrigin,
}

/// An outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
            body: None,
        }
    }

    /// A GET request for `url`.
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidInput(format!("Invalid URL '{}': {}", url, e)))?;
        Ok(Self::new(Method::GET, url))
    }

    /// A page navigation to `url`.
    pub fn navigate(url: &str) -> Result<Self> {
        let mut request = Self::get(url)?;
        request.mode = RequestMode::Navigate;
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("text/html"));
        Ok(request)
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Navigations and requests accepting HTML count as page loads.
    pub fn is_page_load(&self) -> bool {
        self.mode == RequestMode::Navigate
            || self
                .headers
                .get(ACCEPT)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|accept| accept.contains("text/html"))
    }

    /// Identity used for cache entries.
    pub fn cache_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// A response, live or cached.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// A response with the given content type.
    pub fn with_content_type(
        status: StatusCode,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self::new(status, headers, body)
    }

    /// A JSON response.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::with_content_type(status, "application/json", value.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_load_detection() {
        assert!(Request::navigate("http://localhost/dashboard").unwrap().is_page_load());
        let html = Request::get("http://localhost/dashboard")
            .unwrap()
            .with_header(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        assert!(html.is_page_load());
        assert!(!Request::get("http://localhost/app.js").unwrap().is_page_load());
    }

    #[test]
    fn test_cache_key_includes_query() {
        let a = Request::get("http://localhost/api/x?page=1").unwrap();
        let b = Request::get("http://localhost/api/x?page=2").unwrap();
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), "GET http://localhost/api/x?page=1");
    }

    #[test]
    fn test_json_response() {
        let response = Response::json(StatusCode::OK, &json!({"offline": true}));
        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(&response.body[..], br#"{"offline":true}"#);
        assert!(Request::get("not a url").is_err());
    }
}
