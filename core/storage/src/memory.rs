//! In-memory record store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use fsmonitor_common::{Error, Result};

use crate::schema::{CollectionDef, Schema};
use crate::store::{record_key, Key, Record, RecordStore, WriteOp};

/// Records of one collection plus its auto-increment counter.
#[derive(Debug, Clone)]
struct CollectionData {
    def: CollectionDef,
    records: BTreeMap<Key, Record>,
    next_id: i64,
}

impl CollectionData {
    fn new(def: CollectionDef) -> Self {
        Self {
            def,
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn put(&mut self, mut record: Record) -> Result<Key> {
        let key = match record_key(&self.def, &record)? {
            Some(key) => {
                if let (true, Key::Int(id)) = (self.def.auto_increment, &key) {
                    self.next_id = self.next_id.max(id + 1);
                }
                key
            }
            None if self.def.auto_increment => {
                let id = self.next_id;
                self.next_id += 1;
                if let Some(object) = record.as_object_mut() {
                    object.insert(self.def.key_path.clone(), Value::from(id));
                }
                Key::Int(id)
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "Record for '{}' is missing key field '{}'",
                    self.def.name, self.def.key_path
                )));
            }
        };
        self.records.insert(key.clone(), record);
        Ok(key)
    }

    fn indexed<'a>(
        &'a self,
        index: &str,
        value: &'a Value,
    ) -> Result<impl Iterator<Item = &'a Record> + 'a> {
        let field = self
            .def
            .index(index)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Index '{}' not declared on '{}'",
                    index, self.def.name
                ))
            })?
            .field
            .clone();
        Ok(self
            .records
            .values()
            .filter(move |r| r.get(&field) == Some(value)))
    }
}

#[derive(Debug, Default)]
struct Database {
    initialized: bool,
    version: u32,
    collections: HashMap<String, CollectionData>,
}

impl Database {
    fn collection(&self, name: &str) -> Result<&CollectionData> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Collection '{}' does not exist", name)))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionData> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Collection '{}' does not exist", name)))
    }
}

/// In-memory record store.
///
/// Useful for testing and development. Data survives re-initialization
/// with a newer schema but is lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    db: RwLock<Database>,
}

impl MemoryStore {
    /// Create a new, uninitialized store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Database>> {
        let db = self
            .db
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))?;
        if !db.initialized {
            return Err(Error::Storage("Store not initialized".to_string()));
        }
        Ok(db)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Database>> {
        let db = self
            .db
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))?;
        if !db.initialized {
            return Err(Error::Storage("Store not initialized".to_string()));
        }
        Ok(db)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self, schema: &Schema) -> Result<()> {
        schema.validate()?;
        let mut db = self
            .db
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))?;

        if db.version > schema.version {
            return Err(Error::Storage(format!(
                "Store is at schema version {}, code expects {}",
                db.version, schema.version
            )));
        }

        for def in &schema.collections {
            match db.collections.get_mut(&def.name) {
                Some(existing) => {
                    for index in &def.indexes {
                        if existing.def.index(&index.name).is_none() {
                            existing.def.indexes.push(index.clone());
                        }
                    }
                }
                None => {
                    debug!("Creating collection {}", def.name);
                    db.collections
                        .insert(def.name.clone(), CollectionData::new(def.clone()));
                }
            }
        }

        db.version = schema.version;
        db.initialized = true;
        Ok(())
    }

    async fn schema_version(&self) -> Result<u32> {
        let db = self
            .db
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))?;
        Ok(db.version)
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let db = self.read()?;
        Ok(db.collection(collection)?.records.values().cloned().collect())
    }

    async fn get(&self, collection: &str, key: &Key) -> Result<Option<Record>> {
        let db = self.read()?;
        Ok(db.collection(collection)?.records.get(key).cloned())
    }

    async fn put(&self, collection: &str, record: Record) -> Result<Key> {
        let mut db = self.write()?;
        db.collection_mut(collection)?.put(record)
    }

    async fn delete(&self, collection: &str, key: &Key) -> Result<()> {
        let mut db = self.write()?;
        db.collection_mut(collection)?.records.remove(key);
        Ok(())
    }

    async fn bulk_put(&self, collection: &str, records: Vec<Record>) -> Result<()> {
        let mut db = self.write()?;
        let data = db.collection_mut(collection)?;
        let mut staged = data.clone();
        for record in records {
            staged.put(record)?;
        }
        *data = staged;
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<()> {
        let mut db = self.write()?;
        db.collection_mut(collection)?.records.clear();
        Ok(())
    }

    async fn replace_all(&self, collection: &str, records: Vec<Record>) -> Result<()> {
        let mut db = self.write()?;
        let data = db.collection_mut(collection)?;
        let mut staged = data.clone();
        staged.records.clear();
        for record in records {
            staged.put(record)?;
        }
        *data = staged;
        Ok(())
    }

    async fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        let db = self.read()?;
        let records = db.collection(collection)?.indexed(index, value)?.cloned().collect();
        Ok(records)
    }

    async fn count_by_index(&self, collection: &str, index: &str, value: &Value) -> Result<usize> {
        let db = self.read()?;
        let count = db.collection(collection)?.indexed(index, value)?.count();
        Ok(count)
    }

    async fn transact(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut db = self.write()?;

        // Apply against copies of the touched collections, then swap in.
        let mut staged: HashMap<String, CollectionData> = HashMap::new();
        for op in ops {
            let name = match &op {
                WriteOp::Put { collection, .. } | WriteOp::Delete { collection, .. } => {
                    collection.clone()
                }
            };
            if !staged.contains_key(&name) {
                staged.insert(name.clone(), db.collection(&name)?.clone());
            }
            let Some(data) = staged.get_mut(&name) else {
                continue;
            };
            match op {
                WriteOp::Put { record, .. } => {
                    data.put(record)?;
                }
                WriteOp::Delete { key, .. } => {
                    data.records.remove(&key);
                }
            }
        }

        db.collections.extend(staged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        offline_schema, schema_v1, HYGIENE_SETTINGS, PENDING_SUBMISSIONS, SCHEMA_VERSION, STORES,
    };
    use serde_json::json;

    async fn ready_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.initialize(&offline_schema()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_uninitialized_store_fails() {
        let store = MemoryStore::new();
        let err = store.get_all(STORES).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = ready_store().await;
        let key = store.put(STORES, json!({"id": 1, "name": "Dubai Mall"})).await.unwrap();
        assert_eq!(key, Key::Int(1));

        let record = store.get(STORES, &key).await.unwrap().unwrap();
        assert_eq!(record["name"], "Dubai Mall");

        store.delete(STORES, &key).await.unwrap();
        assert!(store.get(STORES, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_increment_assigns_keys() {
        let store = ready_store().await;
        let first = store.put(PENDING_SUBMISSIONS, json!({"status": "pending"})).await.unwrap();
        let second = store.put(PENDING_SUBMISSIONS, json!({"status": "pending"})).await.unwrap();
        assert_eq!(first, Key::Int(1));
        assert_eq!(second, Key::Int(2));

        let record = store.get(PENDING_SUBMISSIONS, &second).await.unwrap().unwrap();
        assert_eq!(record["local_id"], 2);
    }

    #[tokio::test]
    async fn test_auto_increment_skips_explicit_keys() {
        let store = ready_store().await;
        store.put(PENDING_SUBMISSIONS, json!({"local_id": 10})).await.unwrap();
        let next = store.put(PENDING_SUBMISSIONS, json!({})).await.unwrap();
        assert_eq!(next, Key::Int(11));
    }

    #[tokio::test]
    async fn test_missing_key_rejected() {
        let store = ready_store().await;
        let err = store.put(STORES, json!({"name": "No id"})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_index_lookup_and_count() {
        let store = ready_store().await;
        for status in ["pending", "synced", "pending", "failed"] {
            store.put(PENDING_SUBMISSIONS, json!({"status": status})).await.unwrap();
        }
        let pending = store
            .get_by_index(PENDING_SUBMISSIONS, "status", &json!("pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(
            store.count_by_index(PENDING_SUBMISSIONS, "status", &json!("failed")).await.unwrap(),
            1
        );
        assert!(store
            .get_by_index(PENDING_SUBMISSIONS, "nope", &json!("x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bulk_put_is_all_or_nothing() {
        let store = ready_store().await;
        let result = store
            .bulk_put(STORES, vec![json!({"id": 1}), json!({"name": "bad"})])
            .await;
        assert!(result.is_err());
        assert!(store.get_all(STORES).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transact_rolls_back_on_error() {
        let store = ready_store().await;
        store.put(STORES, json!({"id": 1})).await.unwrap();

        let result = store
            .transact(vec![
                WriteOp::delete(STORES, Key::Int(1)),
                WriteOp::put(HYGIENE_SETTINGS, json!({"value": "missing key"})),
            ])
            .await;

        assert!(result.is_err());
        assert!(store.get(STORES, &Key::Int(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upgrade_preserves_data() {
        let store = MemoryStore::new();
        store.initialize(&schema_v1()).await.unwrap();
        store.put(STORES, json!({"id": 5})).await.unwrap();
        assert!(store.get_all(HYGIENE_SETTINGS).await.is_err());

        store.initialize(&offline_schema()).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
        assert_eq!(store.get_all(STORES).await.unwrap().len(), 1);
        assert!(store.get_all(HYGIENE_SETTINGS).await.unwrap().is_empty());

        // Re-initializing at the same version is a no-op.
        store.initialize(&offline_schema()).await.unwrap();
        assert_eq!(store.get_all(STORES).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_downgrade_rejected() {
        let store = ready_store().await;
        let err = store.initialize(&schema_v1()).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}
