//! Named response caches kept in the offline record store.
//!
//! Each cache is a record in `response_caches`; its responses live in
//! `response_cache_entries` under the id `<cache>|<METHOD url>`. Bodies and
//! header values are stored base64-encoded so cached responses come back
//! byte for byte.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use fsmonitor_common::{Error, Result};
use fsmonitor_storage::{
    offline_schema, Key, MemoryStore, RecordStore, WriteOp, RESPONSE_CACHES,
    RESPONSE_CACHE_ENTRIES,
};

use crate::http::{Request, Response};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    name: String,
    /// Creation order.
    seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRecord {
    id: String,
    cache: String,
    request: String,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

fn entry_id(cache: &str, request_key: &str) -> String {
    format!("{}|{}", cache, request_key)
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::Serialization(format!("Cached {} is not base64: {}", field, e)))
}

impl EntryRecord {
    fn new(cache: &str, request_key: String, response: &Response) -> Self {
        Self {
            id: entry_id(cache, &request_key),
            cache: cache.to_string(),
            request: request_key,
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), STANDARD.encode(value.as_bytes())))
                .collect(),
            body: STANDARD.encode(&response.body),
        }
    }

    fn into_response(self) -> Result<Response> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| Error::Serialization(format!("Cached status {}: {}", self.status, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Serialization(format!("Cached header '{}': {}", name, e)))?;
            let value = HeaderValue::from_bytes(&decode("header", value)?)
                .map_err(|e| Error::Serialization(format!("Cached header {}: {}", name, e)))?;
            headers.append(name, value);
        }

        Ok(Response::new(status, headers, decode("body", &self.body)?))
    }
}

/// A set of named caches, searched in creation order.
///
/// Backed by a [`RecordStore`]; with a persistent store the caches survive
/// restarts.
pub struct CacheStorage {
    records: Arc<dyn RecordStore>,
    ready: OnceCell<()>,
}

impl Default for CacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStorage {
    /// Caches that live as long as the process.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Caches kept in `records`, typically the offline database.
    pub fn with_store(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            ready: OnceCell::new(),
        }
    }

    /// The backing store, initialized on first use.
    async fn store(&self) -> Result<&dyn RecordStore> {
        self.ready
            .get_or_try_init(|| async {
                let schema = offline_schema();
                self.records.initialize(&schema).await
            })
            .await?;
        Ok(self.records.as_ref())
    }

    async fn caches(&self) -> Result<Vec<CacheRecord>> {
        let mut caches = self
            .store()
            .await?
            .get_all(RESPONSE_CACHES)
            .await?
            .into_iter()
            .map(serde_json::from_value::<CacheRecord>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        caches.sort_by_key(|cache| cache.seq);
        Ok(caches)
    }

    /// Write op creating `name`, or `None` when it already exists.
    async fn create_op(&self, name: &str) -> Result<Option<WriteOp>> {
        let caches = self.caches().await?;
        if caches.iter().any(|cache| cache.name == name) {
            return Ok(None);
        }
        let seq = caches.last().map_or(1, |cache| cache.seq + 1);
        let record = serde_json::to_value(CacheRecord {
            name: name.to_string(),
            seq,
        })?;
        Ok(Some(WriteOp::put(RESPONSE_CACHES, record)))
    }

    /// Create the named cache if it does not exist.
    pub async fn open(&self, name: &str) -> Result<()> {
        if let Some(op) = self.create_op(name).await? {
            self.store().await?.transact(vec![op]).await?;
            debug!("Created cache {}", name);
        }
        Ok(())
    }

    /// Store `response` for `request` in the named cache, replacing any
    /// previous entry.
    pub async fn put(&self, name: &str, request: &Request, response: Response) -> Result<()> {
        self.put_all(name, vec![(request.cache_key(), response)]).await
    }

    /// Store several entries in the named cache in one transaction.
    pub async fn put_all(&self, name: &str, entries: Vec<(String, Response)>) -> Result<()> {
        let mut ops: Vec<WriteOp> = self.create_op(name).await?.into_iter().collect();
        for (key, response) in entries {
            debug!("Caching {} in {}", key, name);
            let entry = EntryRecord::new(name, key, &response);
            ops.push(WriteOp::put(RESPONSE_CACHE_ENTRIES, serde_json::to_value(entry)?));
        }
        self.store().await?.transact(ops).await
    }

    async fn entry(&self, name: &str, request_key: &str) -> Result<Option<Response>> {
        let key = Key::Text(entry_id(name, request_key));
        match self.store().await?.get(RESPONSE_CACHE_ENTRIES, &key).await? {
            Some(record) => serde_json::from_value::<EntryRecord>(record)?
                .into_response()
                .map(Some),
            None => Ok(None),
        }
    }

    /// Look up `request` in one named cache.
    pub async fn match_in(&self, name: &str, request: &Request) -> Result<Option<Response>> {
        self.entry(name, &request.cache_key()).await
    }

    /// Look up `request` in every cache, oldest first.
    pub async fn match_any(&self, request: &Request) -> Result<Option<Response>> {
        let key = request.cache_key();
        for cache in self.caches().await? {
            if let Some(response) = self.entry(&cache.name, &key).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Delete a named cache and its entries.
    ///
    /// # Returns
    /// Whether the cache existed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let store = self.store().await?;
        if store.get(RESPONSE_CACHES, &Key::from(name)).await?.is_none() {
            return Ok(false);
        }

        let mut ops = vec![WriteOp::delete(RESPONSE_CACHES, Key::from(name))];
        for entry in store
            .get_by_index(RESPONSE_CACHE_ENTRIES, "cache", &json!(name))
            .await?
        {
            if let Some(id) = entry.get("id").and_then(Key::from_json) {
                ops.push(WriteOp::delete(RESPONSE_CACHE_ENTRIES, id));
            }
        }
        store.transact(ops).await?;
        debug!("Deleted cache {}", name);
        Ok(true)
    }

    /// Names of all caches, oldest first.
    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.caches().await?.into_iter().map(|cache| cache.name).collect())
    }

    /// Number of entries in the named cache.
    pub async fn len(&self, name: &str) -> Result<usize> {
        self.store()
            .await?
            .count_by_index(RESPONSE_CACHE_ENTRIES, "cache", &json!(name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmonitor_storage::SqliteStore;
    use reqwest::header::{CONTENT_TYPE, SET_COOKIE};
    use tempfile::TempDir;

    fn ok(body: &'static str) -> Response {
        Response::with_content_type(StatusCode::OK, "text/plain", body)
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let storage = CacheStorage::new();
        let request = Request::get("http://localhost/manifest.json").unwrap();
        storage.put("static-v1", &request, ok("a")).await.unwrap();
        storage.put("static-v1", &request, ok("b")).await.unwrap();

        assert_eq!(storage.match_in("static-v1", &request).await.unwrap(), Some(ok("b")));
        assert_eq!(storage.match_in("other", &request).await.unwrap(), None);
        assert_eq!(storage.len("static-v1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_match_any_prefers_oldest_cache() {
        let storage = CacheStorage::new();
        let request = Request::get("http://localhost/x").unwrap();
        storage.open("first").await.unwrap();
        storage.put("second", &request, ok("second")).await.unwrap();
        storage.put("first", &request, ok("first")).await.unwrap();

        assert_eq!(storage.match_any(&request).await.unwrap(), Some(ok("first")));
    }

    #[tokio::test]
    async fn test_delete_removes_entries() {
        let storage = CacheStorage::new();
        let request = Request::get("http://localhost/x").unwrap();
        storage.put("old-v1", &request, ok("old")).await.unwrap();
        storage.open("new-v2").await.unwrap();

        assert!(storage.delete("old-v1").await.unwrap());
        assert!(!storage.delete("old-v1").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["new-v2".to_string()]);
        assert_eq!(storage.len("old-v1").await.unwrap(), 0);
        assert_eq!(storage.match_any(&request).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_binary_body_and_repeated_headers_survive() {
        let storage = CacheStorage::new();
        let request = Request::get("http://localhost/logo.png").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let png = Response::new(StatusCode::OK, headers, vec![0x89, b'P', b'N', b'G', 0, 0xff]);

        storage.put("static-v1", &request, png.clone()).await.unwrap();
        let cached = storage.match_in("static-v1", &request).await.unwrap().unwrap();
        assert_eq!(cached, png);
        assert_eq!(cached.headers.get_all(SET_COOKIE).iter().count(), 2);
    }

    #[tokio::test]
    async fn test_caches_survive_reopening_the_database() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offline.db");
        let request = Request::get("http://localhost/hygiene-checklist/api/employees").unwrap();
        let live = Response::json(StatusCode::OK, &json!([{"id": 1, "name": "Ana"}]));

        {
            let storage = CacheStorage::with_store(Arc::new(SqliteStore::open(&path).unwrap()));
            storage.open("fs-monitoring-v3").await.unwrap();
            storage
                .put("fs-monitoring-api-v3", &request, live.clone())
                .await
                .unwrap();
        }

        let storage = CacheStorage::with_store(Arc::new(SqliteStore::open(&path).unwrap()));
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["fs-monitoring-v3".to_string(), "fs-monitoring-api-v3".to_string()]
        );
        assert_eq!(storage.match_any(&request).await.unwrap(), Some(live));
    }
}
