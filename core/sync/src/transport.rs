//! Remote service used for delivery and reference-data refresh.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use fsmonitor_common::{Error, Result, ServerId};
use fsmonitor_storage::{Key, Record, ReferenceKind};

/// Server endpoints, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub submit: String,
    pub stores: String,
    pub checklists: String,
    /// Template; `{id}` is replaced with the checklist id.
    pub checklist_items: String,
    pub hygiene_employees: String,
    pub hygiene_checklist_items: String,
    pub hygiene_settings: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            submit: "/api/auditor/submit-audit".to_string(),
            stores: "/api/auditor/stores".to_string(),
            checklists: "/api/auditor/checklists".to_string(),
            checklist_items: "/api/auditor/checklists/{id}/items".to_string(),
            hygiene_employees: "/hygiene-checklist/api/employees".to_string(),
            hygiene_checklist_items: "/hygiene-checklist/api/checklist-items".to_string(),
            hygiene_settings: "/hygiene-checklist/api/settings".to_string(),
        }
    }
}

impl Endpoints {
    /// Path of a wholesale reference endpoint.
    ///
    /// Checklist items have no wholesale endpoint and return `None`.
    pub fn reference(&self, kind: ReferenceKind) -> Option<&str> {
        match kind {
            ReferenceKind::Stores => Some(&self.stores),
            ReferenceKind::Checklists => Some(&self.checklists),
            ReferenceKind::ChecklistItems => None,
            ReferenceKind::HygieneEmployees => Some(&self.hygiene_employees),
            ReferenceKind::HygieneChecklistItems => Some(&self.hygiene_checklist_items),
            ReferenceKind::HygieneSettings => Some(&self.hygiene_settings),
        }
    }

    /// Path listing the items of one checklist.
    pub fn checklist_items_path(&self, checklist_id: &Key) -> String {
        self.checklist_items.replace("{id}", &checklist_id.to_string())
    }
}

/// The server as seen by the sync engine.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Get the service name (e.g., "http", "scripted").
    fn name(&self) -> &str;

    /// Deliver one submission payload verbatim.
    ///
    /// # Errors
    /// - `Network` when the server cannot be reached
    /// - `Delivery` on a non-2xx answer
    /// - `Unconfirmed` on a 2xx answer without a usable `id`
    async fn submit(&self, payload: &Value) -> Result<ServerId>;

    /// Fetch a full reference snapshot.
    async fn fetch_reference(&self, kind: ReferenceKind) -> Result<Vec<Record>>;

    /// Fetch the items of one checklist.
    async fn fetch_checklist_items(&self, checklist_id: &Key) -> Result<Vec<Record>>;
}

/// Extract the server id from a delivery response body.
pub fn server_id_from_body(body: &Value) -> Result<ServerId> {
    let id = body
        .get("id")
        .ok_or_else(|| Error::Unconfirmed("Response has no 'id' field".to_string()))?;
    ServerId::from_json(id).map_err(|e| Error::Unconfirmed(e.to_string()))
}

fn records_from_body(body: Value, what: &str) -> Result<Vec<Record>> {
    match body {
        Value::Array(records) => Ok(records),
        other => Err(Error::Delivery(format!(
            "Expected a JSON array of {}, got {}",
            what,
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// [`RemoteService`] over HTTP.
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    endpoints: Endpoints,
}

impl HttpRemote {
    /// Create a client for the server at `base_url`.
    ///
    /// # Errors
    /// - `base_url` is not an absolute URL
    /// - HTTP client construction failure
    pub fn new(base_url: &str, endpoints: Endpoints, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid base URL '{}': {}", base_url, e)))?;
        let http = Client::builder()
            .user_agent(concat!("fsmonitor/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            endpoints,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid endpoint '{}': {}", path, e)))
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path)?;
        debug!("GET {}", url);

        let response = self
            .http
            .get(url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to fetch {}: {}", path, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Delivery(format!("Server returned {}", status.as_u16())));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Delivery(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, payload: &Value) -> Result<ServerId> {
        let url = self.url(&self.endpoints.submit)?;

        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to submit: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Delivery(format!("Server returned {}", status.as_u16())));
        }

        // Past this point the server has taken the payload.
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Unconfirmed(format!("Failed to parse response: {}", e)))?;
        server_id_from_body(&body)
    }

    async fn fetch_reference(&self, kind: ReferenceKind) -> Result<Vec<Record>> {
        let path = self.endpoints.reference(kind).ok_or_else(|| {
            Error::InvalidInput(format!("{} must be fetched per checklist", kind))
        })?;
        let body = self.get_json(path).await?;
        records_from_body(body, kind.collection())
    }

    async fn fetch_checklist_items(&self, checklist_id: &Key) -> Result<Vec<Record>> {
        let path = self.endpoints.checklist_items_path(checklist_id);
        let body = self.get_json(&path).await?;
        records_from_body(body, "checklist items")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_endpoints() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.submit, "/api/auditor/submit-audit");
        assert_eq!(
            endpoints.checklist_items_path(&Key::Int(12)),
            "/api/auditor/checklists/12/items"
        );
        assert_eq!(
            endpoints.reference(ReferenceKind::HygieneSettings),
            Some("/hygiene-checklist/api/settings")
        );
        assert_eq!(endpoints.reference(ReferenceKind::ChecklistItems), None);
    }

    #[test]
    fn test_server_id_from_body() {
        assert_eq!(server_id_from_body(&json!({"id": 99})).unwrap(), ServerId::from(99));
        assert_eq!(
            server_id_from_body(&json!({"id": "a-1"})).unwrap().as_str(),
            "a-1"
        );
        assert!(matches!(
            server_id_from_body(&json!({"ok": true})),
            Err(Error::Unconfirmed(_))
        ));
        assert!(matches!(
            server_id_from_body(&json!({"id": null})),
            Err(Error::Unconfirmed(_))
        ));
    }

    #[test]
    fn test_records_must_be_array() {
        assert_eq!(records_from_body(json!([{"id": 1}]), "stores").unwrap().len(), 1);
        assert!(records_from_body(json!({"error": "nope"}), "stores").is_err());
    }

    #[test]
    fn test_endpoint_urls_resolve_against_base() {
        let remote = HttpRemote::new(
            "http://localhost:3000/",
            Endpoints::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            remote.url(&remote.endpoints.stores).unwrap().as_str(),
            "http://localhost:3000/api/auditor/stores"
        );
        assert!(HttpRemote::new("not a url", Endpoints::default(), Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let remote = HttpRemote::new(
            "http://127.0.0.1:9",
            Endpoints::default(),
            Duration::from_millis(500),
        )
        .unwrap();
        let err = remote.submit(&json!({"storeId": 1})).await.unwrap_err();
        assert!(err.is_remote());
        assert!(err.is_retryable());
    }

    /// Serve one canned HTTP answer and hand back the raw request.
    async fn serve_once(answer: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(answer.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (base_url, handle)
    }

    #[tokio::test]
    async fn test_created_without_id_is_unconfirmed() {
        let (base_url, server) = serve_once(
            "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 16\r\nConnection: close\r\n\r\n{\"success\":true}",
        )
        .await;
        let remote = HttpRemote::new(&base_url, Endpoints::default(), Duration::from_secs(5)).unwrap();

        let err = remote.submit(&json!({"storeId": 4})).await.unwrap_err();
        assert!(matches!(err, Error::Unconfirmed(_)));
        assert!(!err.is_retryable());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/auditor/submit-audit"));
        assert!(request.contains("\"storeId\":4"));
    }

    #[tokio::test]
    async fn test_created_with_id_is_delivered() {
        let (base_url, server) = serve_once(
            "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 9\r\nConnection: close\r\n\r\n{\"id\":42}",
        )
        .await;
        let remote = HttpRemote::new(&base_url, Endpoints::default(), Duration::from_secs(5)).unwrap();

        assert_eq!(remote.submit(&json!({})).await.unwrap(), ServerId::from(42));
        server.await.unwrap();
    }
}
