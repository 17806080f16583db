//! SQLite-backed record store.
//!
//! Persists every collection in a single `records` table; secondary
//! indexes are SQLite expression indexes over `json_extract(body, ...)`.
//! Statements run on the blocking thread pool.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use fsmonitor_common::{Error, Result};

use crate::schema::{CollectionDef, Schema};
use crate::store::{record_key, Key, Record, RecordStore, WriteOp};

const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    definition TEXT NOT NULL,
    next_id INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (collection, key)
);
"#;

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn encode_key(key: &Key) -> Result<String> {
    Ok(serde_json::to_string(key)?)
}

fn decode_body(body: String) -> Result<Record> {
    serde_json::from_str(&body).map_err(|e| Error::Storage(format!("Corrupted record: {}", e)))
}

fn sql_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

/// Local record store using SQLite.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    /// Collection definitions, loaded by `initialize`.
    defs: RwLock<Option<HashMap<String, CollectionDef>>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    ///
    /// # Errors
    /// - Database creation failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).map_err(storage_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        info!("Offline store opened at {}", db_path.display());
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(BASE_SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            defs: RwLock::new(None),
        })
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("SQLite task failed: {}", e)))?
    }

    fn stored_version(conn: &Connection) -> Result<u32> {
        let version = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'schema_version'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(storage_err)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(version)
    }

    fn initialize_in(
        conn: &mut Connection,
        schema: &Schema,
    ) -> Result<HashMap<String, CollectionDef>> {
        let tx = conn.transaction().map_err(storage_err)?;

        let stored = Self::stored_version(&tx)?;
        if stored > schema.version {
            return Err(Error::Storage(format!(
                "Store is at schema version {}, code expects {}",
                stored, schema.version
            )));
        }

        let mut defs = HashMap::new();
        for def in &schema.collections {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT definition FROM collections WHERE name = ?1",
                    params![def.name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;

            let merged = match existing {
                Some(json) => {
                    let mut current: CollectionDef = serde_json::from_str(&json)
                        .map_err(|e| Error::Storage(format!("Corrupted schema: {}", e)))?;
                    for index in &def.indexes {
                        if current.index(&index.name).is_none() {
                            current.indexes.push(index.clone());
                        }
                    }
                    current
                }
                None => {
                    debug!("Creating collection {}", def.name);
                    def.clone()
                }
            };

            tx.execute(
                "INSERT INTO collections (name, definition) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET definition = excluded.definition",
                params![merged.name, serde_json::to_string(&merged)?],
            )
            .map_err(storage_err)?;
            Self::create_indexes(&tx, &merged)?;
            defs.insert(merged.name.clone(), merged);
        }

        // Collections dropped from the code's schema stay readable.
        {
            let mut stmt = tx
                .prepare("SELECT definition FROM collections")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(storage_err)?;
            for json in rows {
                let def: CollectionDef = serde_json::from_str(&json.map_err(storage_err)?)
                    .map_err(|e| Error::Storage(format!("Corrupted schema: {}", e)))?;
                defs.entry(def.name.clone()).or_insert(def);
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('schema_version', ?1)",
            params![schema.version.to_string()],
        )
        .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;
        Ok(defs)
    }

    fn def(&self, collection: &str) -> Result<CollectionDef> {
        let defs = self
            .defs
            .read()
            .map_err(|_| Error::Storage("Schema lock poisoned".to_string()))?;
        let defs = defs
            .as_ref()
            .ok_or_else(|| Error::Storage("Store not initialized".to_string()))?;
        defs.get(collection)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Collection '{}' does not exist", collection)))
    }

    fn index_field(def: &CollectionDef, index: &str) -> Result<String> {
        def.index(index).map(|i| i.field.clone()).ok_or_else(|| {
            Error::NotFound(format!("Index '{}' not declared on '{}'", index, def.name))
        })
    }

    fn put_in(conn: &Connection, def: &CollectionDef, mut record: Record) -> Result<Key> {
        let key = match record_key(def, &record)? {
            Some(key) => {
                if let (true, Key::Int(id)) = (def.auto_increment, &key) {
                    conn.execute(
                        "UPDATE collections SET next_id = MAX(next_id, ?1) WHERE name = ?2",
                        params![id + 1, def.name],
                    )
                    .map_err(storage_err)?;
                }
                key
            }
            None if def.auto_increment => {
                let id: i64 = conn
                    .query_row(
                        "SELECT next_id FROM collections WHERE name = ?1",
                        params![def.name],
                        |row| row.get(0),
                    )
                    .map_err(storage_err)?;
                conn.execute(
                    "UPDATE collections SET next_id = ?1 WHERE name = ?2",
                    params![id + 1, def.name],
                )
                .map_err(storage_err)?;
                if let Some(object) = record.as_object_mut() {
                    object.insert(def.key_path.clone(), Value::from(id));
                }
                Key::Int(id)
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "Record for '{}' is missing key field '{}'",
                    def.name, def.key_path
                )));
            }
        };

        conn.execute(
            "INSERT OR REPLACE INTO records (collection, key, body) VALUES (?1, ?2, ?3)",
            params![def.name, encode_key(&key)?, serde_json::to_string(&record)?],
        )
        .map_err(storage_err)?;
        Ok(key)
    }

    fn create_indexes(conn: &Connection, def: &CollectionDef) -> Result<()> {
        for index in &def.indexes {
            // Names are validated identifiers, so inlining them is safe.
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{} ON records (collection, json_extract(body, '$.{}'))",
                def.name, index.name, index.field
            );
            conn.execute_batch(&sql).map_err(storage_err)?;
        }
        Ok(())
    }

    fn query_bodies<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<Record>> {
        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        let mut records = Vec::new();
        for body in rows {
            records.push(decode_body(body.map_err(storage_err)?)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn initialize(&self, schema: &Schema) -> Result<()> {
        schema.validate()?;
        let schema = schema.clone();
        let version = schema.version;
        let defs = self
            .with_conn(move |conn| Self::initialize_in(conn, &schema))
            .await?;

        let mut slot = self
            .defs
            .write()
            .map_err(|_| Error::Storage("Schema lock poisoned".to_string()))?;
        *slot = Some(defs);

        info!("Offline store initialized at schema version {}", version);
        Ok(())
    }

    async fn schema_version(&self) -> Result<u32> {
        self.with_conn(|conn| Self::stored_version(conn)).await
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let def = self.def(collection)?;
        self.with_conn(move |conn| {
            Self::query_bodies(
                conn,
                "SELECT body FROM records WHERE collection = ?1 ORDER BY rowid",
                params![def.name],
            )
        })
        .await
    }

    async fn get(&self, collection: &str, key: &Key) -> Result<Option<Record>> {
        let def = self.def(collection)?;
        let key = encode_key(key)?;
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM records WHERE collection = ?1 AND key = ?2",
                    params![def.name, key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            body.map(decode_body).transpose()
        })
        .await
    }

    async fn put(&self, collection: &str, record: Record) -> Result<Key> {
        let def = self.def(collection)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            let key = Self::put_in(&tx, &def, record)?;
            tx.commit().map_err(storage_err)?;
            Ok(key)
        })
        .await
    }

    async fn delete(&self, collection: &str, key: &Key) -> Result<()> {
        let def = self.def(collection)?;
        let key = encode_key(key)?;
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                params![def.name, key],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn bulk_put(&self, collection: &str, records: Vec<Record>) -> Result<()> {
        let def = self.def(collection)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            for record in records {
                Self::put_in(&tx, &def, record)?;
            }
            tx.commit().map_err(storage_err)
        })
        .await
    }

    async fn clear(&self, collection: &str) -> Result<()> {
        let def = self.def(collection)?;
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM records WHERE collection = ?1", params![def.name])
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn replace_all(&self, collection: &str, records: Vec<Record>) -> Result<()> {
        let def = self.def(collection)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            tx.execute("DELETE FROM records WHERE collection = ?1", params![def.name])
                .map_err(storage_err)?;
            for record in records {
                Self::put_in(&tx, &def, record)?;
            }
            tx.commit().map_err(storage_err)
        })
        .await
    }

    async fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        let def = self.def(collection)?;
        let field = Self::index_field(&def, index)?;
        let sql = format!(
            "SELECT body FROM records WHERE collection = ?1 AND json_extract(body, '$.{}') IS ?2 ORDER BY rowid",
            field
        );
        let value = sql_value(value);
        self.with_conn(move |conn| Self::query_bodies(conn, &sql, params![def.name, value]))
            .await
    }

    async fn count_by_index(&self, collection: &str, index: &str, value: &Value) -> Result<usize> {
        let def = self.def(collection)?;
        let field = Self::index_field(&def, index)?;
        let sql = format!(
            "SELECT COUNT(*) FROM records WHERE collection = ?1 AND json_extract(body, '$.{}') IS ?2",
            field
        );
        let value = sql_value(value);
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(&sql, params![def.name, value], |row| row.get(0))
                .map_err(storage_err)?;
            Ok(count as usize)
        })
        .await
    }

    async fn transact(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut resolved = Vec::with_capacity(ops.len());
        for op in ops {
            let def = match &op {
                WriteOp::Put { collection, .. } | WriteOp::Delete { collection, .. } => {
                    self.def(collection)?
                }
            };
            resolved.push((def, op));
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            for (def, op) in resolved {
                match op {
                    WriteOp::Put { record, .. } => {
                        Self::put_in(&tx, &def, record)?;
                    }
                    WriteOp::Delete { key, .. } => {
                        tx.execute(
                            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                            params![def.name, encode_key(&key)?],
                        )
                        .map_err(storage_err)?;
                    }
                }
            }
            tx.commit().map_err(storage_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        offline_schema, schema_v1, CHECKLIST_ITEMS, HYGIENE_EMPLOYEES, PENDING_SUBMISSIONS,
        SCHEMA_VERSION, STORES,
    };
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_operations() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize(&offline_schema()).await.unwrap();

        let key = store.put(STORES, json!({"id": 1, "name": "Marina"})).await.unwrap();
        let record = store.get(STORES, &key).await.unwrap().unwrap();
        assert_eq!(record["name"], "Marina");

        store.delete(STORES, &key).await.unwrap();
        assert!(store.get(STORES, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.get_all(STORES).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_auto_increment_and_index() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize(&offline_schema()).await.unwrap();

        let a = store.put(PENDING_SUBMISSIONS, json!({"status": "pending"})).await.unwrap();
        let b = store.put(PENDING_SUBMISSIONS, json!({"status": "failed"})).await.unwrap();
        assert_eq!(a, Key::Int(1));
        assert_eq!(b, Key::Int(2));

        let pending = store
            .get_by_index(PENDING_SUBMISSIONS, "status", &json!("pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["local_id"], 1);
        assert_eq!(
            store.count_by_index(PENDING_SUBMISSIONS, "status", &json!("failed")).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_integer_index_lookup() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize(&offline_schema()).await.unwrap();
        store
            .bulk_put(
                CHECKLIST_ITEMS,
                vec![
                    json!({"id": 1, "checklist_id": 4}),
                    json!({"id": 2, "checklist_id": 4}),
                    json!({"id": 3, "checklist_id": 5}),
                ],
            )
            .await
            .unwrap();

        let items = store
            .get_by_index(CHECKLIST_ITEMS, "checklist_id", &json!(4))
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_replace_all_and_transact_atomicity() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize(&offline_schema()).await.unwrap();

        store
            .replace_all(STORES, vec![json!({"id": 1}), json!({"id": 2})])
            .await
            .unwrap();
        store.replace_all(STORES, vec![json!({"id": 3})]).await.unwrap();
        assert_eq!(store.get_all(STORES).await.unwrap(), vec![json!({"id": 3})]);

        let result = store
            .transact(vec![
                WriteOp::delete(STORES, Key::Int(3)),
                WriteOp::put(STORES, json!({"name": "missing id"})),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(store.get_all(STORES).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_and_upgrade() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offline.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.initialize(&schema_v1()).await.unwrap();
            store.put(STORES, json!({"id": 9, "name": "JBR"})).await.unwrap();
            store.put(PENDING_SUBMISSIONS, json!({"status": "pending"})).await.unwrap();
        }

        {
            let store = SqliteStore::open(&path).unwrap();
            assert_eq!(store.schema_version().await.unwrap(), 1);
            store.initialize(&offline_schema()).await.unwrap();
            assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);

            assert_eq!(store.get_all(STORES).await.unwrap().len(), 1);
            assert!(store.get_all(HYGIENE_EMPLOYEES).await.unwrap().is_empty());

            // The auto-increment counter survives reopening.
            let next = store.put(PENDING_SUBMISSIONS, json!({"status": "pending"})).await.unwrap();
            assert_eq!(next, Key::Int(2));
        }
    }

    #[tokio::test]
    async fn test_downgrade_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize(&offline_schema()).await.unwrap();
        assert!(store.initialize(&schema_v1()).await.is_err());
    }
}
